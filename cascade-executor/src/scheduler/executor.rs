//! The pipeline execution engine.
//!
//! One orchestration loop owns all join state and routes messages; user
//! callables run on spawned tasks in a work-stealing pool. Per-node
//! concurrency policies are enforced with fair semaphores, so serial nodes
//! observe arrival order and bounded nodes wait FIFO. Flush markers traverse
//! nodes without invoking callables and are forwarded only once the closing
//! subtree is quiescent at the node: every firing completed and no buffered
//! record inside it can still fire. That is what releases reduction
//! finalizers at the right moment.
//!
//! ## Failure semantics
//!
//! A user callable that panics or returns an error poisons its record: the
//! record's outputs are withheld, downstream nodes skip the record, and the
//! first fault is surfaced when `execute()` returns. Siblings are unaffected
//! and reductions finalize with the contributions they have. Internal
//! invariant violations abort the run.

use crate::builder::{container_layout, ExecNode, ExecutorGraph};
use crate::graph::NodeIndex;
use crate::scheduler::{DriverEvent, ExecutorConfig, InputJoin, ReadyTuple, SourceDriver};
use cascade_core::declare::{Accumulator, NodeBehavior, NodeKind};
use cascade_core::error::{CascadeError, Result};
use cascade_core::persistence::Persistence;
use cascade_core::source::RecordSource;
use cascade_core::store::{more_derived, StorePtr};
use cascade_core::types::LevelIdPtr;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

/// Counters reported by a completed execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionSummary {
    /// Records pulled from the source.
    pub records: u64,
    /// User-callable invocations (including folds and finalizers).
    pub firings: u64,
    /// Records poisoned by failed callables.
    pub poisoned: u64,
}

/// Per-ancestor reduction state.
struct ReductionSlot {
    ancestor: StorePtr,
    acc: Option<Accumulator>,
}

type AccMap = Arc<DashMap<LevelIdPtr, Arc<Mutex<ReductionSlot>>>>;

/// Result of one spawned invocation.
struct TaskDone {
    node: NodeIndex,
    key: LevelIdPtr,
    outcome: TaskOutcome,
}

enum TaskOutcome {
    /// Invocation finished without emissions (observers, outputs, folds).
    Quiet,
    /// A transform emitted its continuation.
    Emit(StorePtr),
    /// A splitter emitted child records.
    Children(Vec<StorePtr>),
    /// A reduction finalized; the held flush follows the result.
    Finalized(StorePtr),
    /// The user callable failed.
    Failed(String),
}

enum Routed {
    Record {
        to: NodeIndex,
        port: usize,
        store: StorePtr,
    },
    Flush {
        to: NodeIndex,
        port: usize,
        store: StorePtr,
    },
}

struct RunState {
    joins: Vec<InputJoin>,
    outstanding: Vec<HashMap<LevelIdPtr, usize>>,
    accumulators: Vec<Option<AccMap>>,
    semaphores: Vec<Option<Arc<Semaphore>>>,
    held_flushes: Vec<(NodeIndex, LevelIdPtr, StorePtr)>,
    poisoned: Vec<LevelIdPtr>,
    first_error: Option<CascadeError>,
    queue: VecDeque<Routed>,
    firings: u64,
    poisoned_count: u64,
    cancelling: bool,
}

impl RunState {
    fn new(graph: &ExecutorGraph) -> Self {
        let joins = graph
            .nodes
            .iter()
            .map(|node| InputJoin::new(node.ports.len()))
            .collect();
        let semaphores = graph
            .nodes
            .iter()
            .map(|node| {
                node.concurrency
                    .limit()
                    .map(|limit| Arc::new(Semaphore::new(limit)))
            })
            .collect();
        let accumulators: Vec<Option<AccMap>> = graph
            .nodes
            .iter()
            .map(|node| {
                if node.kind == NodeKind::Reduction {
                    Some(Arc::new(DashMap::new()))
                } else {
                    None
                }
            })
            .collect();
        Self {
            joins,
            outstanding: vec![HashMap::new(); graph.nodes.len()],
            accumulators,
            semaphores,
            held_flushes: Vec::new(),
            poisoned: Vec::new(),
            first_error: None,
            queue: VecDeque::new(),
            firings: 0,
            poisoned_count: 0,
            cancelling: false,
        }
    }

    fn is_poisoned(&self, key: &LevelIdPtr) -> bool {
        self.poisoned.iter().any(|p| p.encloses(key))
    }

    fn poison(&mut self, node_name: String, key: &LevelIdPtr, cause: String) {
        tracing::warn!(
            node = %node_name,
            record = %key.encode(),
            %cause,
            "user callable failed; poisoning record"
        );
        if !self.is_poisoned(key) {
            self.poisoned.push(Arc::clone(key));
        }
        self.poisoned_count += 1;
        if self.first_error.is_none() {
            self.first_error = Some(CascadeError::UserCallableFailed {
                node: node_name,
                record: key.encode(),
                cause,
            });
        }
    }
}

/// Drives records from one source through the wired graph.
pub struct PipelineExecutor {
    graph: ExecutorGraph,
    config: ExecutorConfig,
    persistence: Option<Arc<dyn Persistence>>,
    token: CancellationToken,
}

impl PipelineExecutor {
    /// Create an executor over a wired graph.
    #[must_use]
    pub fn new(graph: ExecutorGraph, config: ExecutorConfig) -> Self {
        Self {
            graph,
            config,
            persistence: None,
            token: CancellationToken::new(),
        }
    }

    /// Attach the persistence back-end output nodes write through.
    #[must_use]
    pub fn with_persistence(mut self, persistence: Arc<dyn Persistence>) -> Self {
        self.persistence = Some(persistence);
        self
    }

    /// A token that cancels the execution when triggered: the scheduler stops
    /// accepting new work from the source, drains in-flight invocations, and
    /// returns [`CascadeError::Cancelled`].
    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Execute the graph to completion over `source`.
    ///
    /// # Errors
    /// Returns the first [`CascadeError::UserCallableFailed`] (after the
    /// graph drains), [`CascadeError::SourceExhaustedPrematurely`],
    /// [`CascadeError::Cancelled`], or an aborting
    /// [`CascadeError::InternalInvariant`].
    #[instrument(skip_all, fields(source = %self.graph.source_name, nodes = self.graph.nodes.len()))]
    pub async fn execute(&self, source: Box<dyn RecordSource>) -> Result<ExecutionSummary> {
        if source.name() != self.graph.source_name {
            return Err(CascadeError::Configuration {
                cause: format!(
                    "graph was wired for source '{}' but executed with '{}'",
                    self.graph.source_name,
                    source.name()
                ),
            });
        }
        self.prepare_outputs()?;

        let mut driver = SourceDriver::new(source);
        let mut state = RunState::new(&self.graph);
        let mut tasks: JoinSet<TaskDone> = JoinSet::new();

        loop {
            while let Some(routed) = state.queue.pop_front() {
                self.deliver(&mut state, &mut tasks, routed);
            }
            self.forward_flushes(&mut state, &mut tasks);
            if !state.queue.is_empty() {
                continue;
            }

            if !driver.exhausted()
                && !state.cancelling
                && tasks.len() < self.config.max_concurrent_firings
            {
                match driver.pull() {
                    Ok(events) => {
                        for event in events {
                            match event {
                                DriverEvent::Record(store) => {
                                    self.broadcast_record(&mut state, 0, store);
                                }
                                DriverEvent::Flush(store) => {
                                    self.broadcast_flush(&mut state, 0, &store);
                                }
                            }
                        }
                    }
                    Err(err @ CascadeError::InternalInvariant { .. }) => {
                        tasks.abort_all();
                        return Err(err);
                    }
                    Err(err) => {
                        tracing::error!(error = %err, "source failed; draining");
                        if state.first_error.is_none() {
                            state.first_error = Some(err);
                        }
                    }
                }
                continue;
            }

            if tasks.is_empty() {
                break;
            }

            tokio::select! {
                () = self.token.cancelled(), if !state.cancelling => {
                    tracing::info!("cancellation requested; draining in-flight invocations");
                    state.cancelling = true;
                    state.queue.clear();
                }
                joined = tasks.join_next() => {
                    match joined {
                        Some(Ok(done)) => self.handle_completion(&mut state, done),
                        Some(Err(join_err)) => {
                            tasks.abort_all();
                            return Err(CascadeError::InternalInvariant {
                                cause: format!("invocation task lost: {join_err}"),
                            });
                        }
                        None => {}
                    }
                }
            }
        }

        if let Some(err) = state.first_error {
            return Err(err);
        }
        if state.cancelling {
            return Err(CascadeError::Cancelled);
        }
        let summary = ExecutionSummary {
            records: driver.records(),
            firings: state.firings,
            poisoned: state.poisoned_count,
        };
        tracing::info!(
            records = summary.records,
            firings = summary.firings,
            "execution complete"
        );
        Ok(summary)
    }

    /// Create persistence containers for every output node.
    fn prepare_outputs(&self) -> Result<()> {
        for node in &self.graph.nodes {
            if node.kind != NodeKind::Output {
                continue;
            }
            let Some(persistence) = &self.persistence else {
                return Err(CascadeError::Configuration {
                    cause: format!(
                        "output node '{}' declared but no persistence back-end attached",
                        node.name
                    ),
                });
            };
            persistence.create_containers(&node.name.to_string(), &container_layout(node))?;
        }
        Ok(())
    }

    fn broadcast_record(&self, state: &mut RunState, from: NodeIndex, store: StorePtr) {
        for edge in self.graph.graph.outgoing_edges(from) {
            state.queue.push_back(Routed::Record {
                to: edge.to,
                port: edge.port,
                store: Arc::clone(&store),
            });
        }
    }

    fn broadcast_flush(&self, state: &mut RunState, from: NodeIndex, store: &StorePtr) {
        for edge in self.graph.graph.outgoing_edges(from) {
            state.queue.push_back(Routed::Flush {
                to: edge.to,
                port: edge.port,
                store: Arc::clone(store),
            });
        }
    }

    fn deliver(&self, state: &mut RunState, tasks: &mut JoinSet<TaskDone>, routed: Routed) {
        match routed {
            Routed::Record { to, port, store } => {
                if state.cancelling || state.is_poisoned(store.id()) {
                    return;
                }
                // An ancestor-level message can complete several waiting
                // descendant tuples at once.
                for ready in state.joins[to].deliver(port, store) {
                    self.consider_firing(state, tasks, to, ready);
                }
            }
            Routed::Flush { to, port, store } => {
                let required = self.graph.flush_ports(to, store.level_name());
                state.joins[to].deliver_flush(port, &store, &required);
            }
        }
    }

    /// Check record applicability (poisoning, input presence, predicates) and
    /// spawn the invocation if the record qualifies.
    fn consider_firing(
        &self,
        state: &mut RunState,
        tasks: &mut JoinSet<TaskDone>,
        node_idx: NodeIndex,
        ready: ReadyTuple,
    ) {
        let node = &self.graph.nodes[node_idx];
        let Some(decl) = node.declaration.as_ref() else {
            return;
        };
        if state.is_poisoned(&ready.key) {
            return;
        }
        // A record qualifies only at the level where all its inputs resolve.
        for (i, query) in decl.inputs().iter().enumerate() {
            if ready.stores[node.input_ports[i]].lookup(query.label()).is_none() {
                return;
            }
        }
        for (j, query) in decl.predicates().iter().enumerate() {
            let store = &ready.stores[node.predicate_ports[j]];
            match store.lookup(query.label()).and_then(|p| p.downcast::<bool>().copied()) {
                Some(true) => {}
                Some(false) | None => return,
            }
        }
        self.spawn_firing(state, tasks, node_idx, ready);
    }

    fn spawn_firing(
        &self,
        state: &mut RunState,
        tasks: &mut JoinSet<TaskDone>,
        node_idx: NodeIndex,
        ready: ReadyTuple,
    ) {
        *state.outstanding[node_idx]
            .entry(Arc::clone(&ready.key))
            .or_insert(0) += 1;
        state.firings += 1;

        let node = Arc::clone(&self.graph.nodes[node_idx]);
        let semaphore = state.semaphores[node_idx].clone();
        let accumulators = state.accumulators[node_idx].clone();
        let persistence = self.persistence.clone();

        tasks.spawn(async move {
            let _permit = match &semaphore {
                Some(s) => Some(
                    Arc::clone(s)
                        .acquire_owned()
                        .await
                        .expect("node semaphore never closed"),
                ),
                None => None,
            };
            let key = Arc::clone(&ready.key);
            let outcome = invoke_node(&node, &ready, accumulators.as_ref(), persistence.as_deref());
            TaskDone {
                node: node_idx,
                key,
                outcome,
            }
        });
    }

    fn spawn_finalize(
        &self,
        state: &mut RunState,
        tasks: &mut JoinSet<TaskDone>,
        node_idx: NodeIndex,
        slot: Arc<Mutex<ReductionSlot>>,
        flush: &StorePtr,
    ) {
        let key = Arc::clone(flush.id());
        *state.outstanding[node_idx]
            .entry(Arc::clone(&key))
            .or_insert(0) += 1;
        state.firings += 1;
        state
            .held_flushes
            .push((node_idx, Arc::clone(&key), Arc::clone(flush)));

        let node = Arc::clone(&self.graph.nodes[node_idx]);
        let semaphore = state.semaphores[node_idx].clone();
        tasks.spawn(async move {
            let _permit = match &semaphore {
                Some(s) => Some(
                    Arc::clone(s)
                        .acquire_owned()
                        .await
                        .expect("node semaphore never closed"),
                ),
                None => None,
            };
            let outcome = finalize_slot(&node, &slot);
            TaskDone {
                node: node_idx,
                key,
                outcome,
            }
        });
    }

    /// Forward every flush whose subtree is quiescent at the node: barrier
    /// complete, no in-flight invocations under it, no partial tuple that
    /// could still fire inside it, and no inner flush still waiting (inner
    /// levels forward first). Strand tuples strictly below a forwardable
    /// flush are purged by it. Reduction-level flushes trigger the finalizer
    /// first and are held until it completes.
    fn forward_flushes(&self, state: &mut RunState, tasks: &mut JoinSet<TaskDone>) {
        if state.cancelling {
            return;
        }
        loop {
            let mut progressed = false;
            for node_idx in 1..self.graph.nodes.len() {
                let mut completed = state.joins[node_idx].completed_flushes();
                completed.sort_by(|a, b| b.id().depth().cmp(&a.id().depth()));
                for flush in completed {
                    let id = Arc::clone(flush.id());
                    if state.outstanding[node_idx].keys().any(|k| id.encloses(k)) {
                        continue;
                    }
                    if state.joins[node_idx].purge_below(&id) > 0 {
                        progressed = true;
                    }
                    if state.joins[node_idx].has_pending_under(&id)
                        || state.joins[node_idx].has_deeper_flush(&id)
                    {
                        continue;
                    }
                    state.joins[node_idx].remove_flush(&id);
                    progressed = true;

                    let node = &self.graph.nodes[node_idx];
                    if node.kind == NodeKind::Reduction {
                        let at_level = node
                            .declaration
                            .as_ref()
                            .and_then(|d| d.level.as_deref())
                            == Some(flush.level_name());
                        if at_level {
                            let slot = state.accumulators[node_idx]
                                .as_ref()
                                .and_then(|accs| accs.remove(&id))
                                .map(|(_, slot)| slot);
                            if let Some(slot) = slot {
                                self.spawn_finalize(state, tasks, node_idx, slot, &flush);
                                continue;
                            }
                        }
                    }
                    self.broadcast_flush(state, node_idx, &flush);
                }
            }
            if !progressed || !state.queue.is_empty() {
                break;
            }
        }
    }

    fn handle_completion(&self, state: &mut RunState, done: TaskDone) {
        let TaskDone { node, key, outcome } = done;
        if let Some(count) = state.outstanding[node].get_mut(&key) {
            *count -= 1;
            if *count == 0 {
                state.outstanding[node].remove(&key);
            }
        }

        if !state.cancelling {
            match outcome {
                TaskOutcome::Quiet => {}
                TaskOutcome::Emit(store) => self.broadcast_record(state, node, store),
                TaskOutcome::Children(children) => {
                    for child in children {
                        let flush = child.make_flush();
                        self.broadcast_record(state, node, child);
                        self.broadcast_flush(state, node, &flush);
                    }
                }
                TaskOutcome::Finalized(store) => self.broadcast_record(state, node, store),
                TaskOutcome::Failed(cause) => {
                    let name = self.graph.nodes[node].name.to_string();
                    state.poison(name, &key, cause);
                    // Partial tuples of the poisoned subtree can never fire;
                    // dropping them lets the subtree's flushes move on.
                    for join in &mut state.joins {
                        join.purge_subtree(&key);
                    }
                }
            }
        }

        // A reduction's held flush follows once its finalizer has completed.
        if let Some(pos) = state
            .held_flushes
            .iter()
            .position(|(n, k, _)| *n == node && *k == key)
        {
            if !state.outstanding[node].contains_key(&key) {
                let (_, _, flush) = state.held_flushes.remove(pos);
                if !state.cancelling {
                    self.broadcast_flush(state, node, &flush);
                }
            }
        }
    }
}

fn most_derived_store(stores: &[StorePtr]) -> StorePtr {
    let mut best = Arc::clone(&stores[0]);
    for store in &stores[1..] {
        best = more_derived(&best, store);
    }
    best
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "user callable panicked".to_string()
    }
}

fn invoke_node(
    node: &ExecNode,
    ready: &ReadyTuple,
    accumulators: Option<&AccMap>,
    persistence: Option<&dyn Persistence>,
) -> TaskOutcome {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        run_behavior(node, ready, accumulators, persistence)
    }));
    match result {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => TaskOutcome::Failed(err.to_string()),
        Err(panic) => TaskOutcome::Failed(panic_message(panic.as_ref())),
    }
}

fn run_behavior(
    node: &ExecNode,
    ready: &ReadyTuple,
    accumulators: Option<&AccMap>,
    persistence: Option<&dyn Persistence>,
) -> Result<TaskOutcome> {
    let decl = node
        .declaration
        .as_ref()
        .ok_or_else(|| CascadeError::InternalInvariant {
            cause: "source node cannot be invoked".to_string(),
        })?;
    let producer = node.name.to_string();
    let input_stores: Vec<StorePtr> = node
        .input_ports
        .iter()
        .map(|&port| Arc::clone(&ready.stores[port]))
        .collect();

    match &decl.behavior {
        NodeBehavior::Transform { invoke } => {
            let products = invoke(&input_stores, decl.inputs())?;
            let base = most_derived_store(&ready.stores);
            Ok(TaskOutcome::Emit(base.make_continuation(&producer, products)))
        }
        NodeBehavior::Observer { invoke } => {
            invoke(&input_stores, decl.inputs())?;
            Ok(TaskOutcome::Quiet)
        }
        NodeBehavior::Output => {
            let persistence = persistence.ok_or_else(|| CascadeError::Configuration {
                cause: format!("output node '{producer}' has no persistence back-end"),
            })?;
            for (i, (label, _tag)) in node.output_items.iter().enumerate() {
                let product = input_stores[i].lookup(label).cloned().ok_or_else(|| {
                    CascadeError::InternalInvariant {
                        cause: format!("output product '{label}' vanished before write"),
                    }
                })?;
                persistence.register_write(&producer, label, &product)?;
            }
            persistence.commit_output(&producer, &ready.key.encode())?;
            Ok(TaskOutcome::Quiet)
        }
        NodeBehavior::Reduction { init, fold, .. } => {
            let level = decl.level.as_deref().ok_or_else(|| {
                CascadeError::InternalInvariant {
                    cause: format!("reduction '{producer}' lost its aggregation level"),
                }
            })?;
            let base = most_derived_store(&ready.stores);
            // Records at or above the aggregation level do not fold.
            let Some(ancestor) = base.parent_at(level) else {
                return Ok(TaskOutcome::Quiet);
            };
            let accumulators =
                accumulators.ok_or_else(|| CascadeError::InternalInvariant {
                    cause: format!("reduction '{producer}' has no accumulator map"),
                })?;
            let slot = accumulators
                .entry(Arc::clone(ancestor.id()))
                .or_insert_with(|| {
                    Arc::new(Mutex::new(ReductionSlot {
                        ancestor: Arc::clone(ancestor),
                        acc: Some(init()),
                    }))
                })
                .clone();
            let mut guard = slot.lock();
            let acc = guard
                .acc
                .as_mut()
                .ok_or_else(|| CascadeError::InternalInvariant {
                    cause: format!("reduction '{producer}' folded after finalization"),
                })?;
            fold(acc, &input_stores, decl.inputs())?;
            Ok(TaskOutcome::Quiet)
        }
        NodeBehavior::Splitter { invoke } => {
            let level = decl.level.as_deref().ok_or_else(|| {
                CascadeError::InternalInvariant {
                    cause: format!("splitter '{producer}' lost its child level"),
                }
            })?;
            let bags = invoke(&input_stores, decl.inputs())?;
            let base = most_derived_store(&ready.stores);
            let mut children = Vec::with_capacity(bags.len());
            for (number, bag) in bags.into_iter().enumerate() {
                children.push(base.make_child(number, level, &producer, bag)?);
            }
            Ok(TaskOutcome::Children(children))
        }
    }
}

fn finalize_slot(node: &ExecNode, slot: &Mutex<ReductionSlot>) -> TaskOutcome {
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| -> Result<TaskOutcome> {
        let decl = node
            .declaration
            .as_ref()
            .ok_or_else(|| CascadeError::InternalInvariant {
                cause: "finalize on an undeclared node".to_string(),
            })?;
        let NodeBehavior::Reduction { finalize, .. } = &decl.behavior else {
            return Err(CascadeError::InternalInvariant {
                cause: format!("finalize on non-reduction '{}'", node.name),
            });
        };
        let (ancestor, acc) = {
            let mut guard = slot.lock();
            let acc = guard
                .acc
                .take()
                .ok_or_else(|| CascadeError::InternalInvariant {
                    cause: format!("reduction '{}' finalized twice", node.name),
                })?;
            (Arc::clone(&guard.ancestor), acc)
        };
        let products = finalize(acc)?;
        Ok(TaskOutcome::Finalized(
            ancestor.make_continuation(&node.name.to_string(), products),
        ))
    }));
    match result {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(err)) => TaskOutcome::Failed(err.to_string()),
        Err(panic) => TaskOutcome::Failed(panic_message(panic.as_ref())),
    }
}
