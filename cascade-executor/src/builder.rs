//! Graph builder: resolves producer/consumer wiring into an executor graph.
//!
//! The builder collects node declarations, builds a producer map over all
//! declared output specifications, resolves every input query and predicate
//! to its unique producer, assigns one input port per distinct upstream
//! producer, rejects cycles, and computes a deterministic topological order.
//! The result is read-only once built.

use crate::graph::{Edge, FlowGraph, GraphNode, NodeIndex};
use cascade_core::declare::{Concurrency, NodeDeclaration, NodeKind, OutputSpec};
use cascade_core::error::{CascadeError, Result};
use cascade_core::module::Module;
use cascade_core::source::RecordSource;
use cascade_core::spec::{ProductQuery, ProductSpecification};
use cascade_core::types::QualifiedName;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;

/// Module name under which the root source is registered in the graph.
const SOURCE_MODULE: &str = "source";

/// One wired node, ready for execution.
#[derive(Debug)]
pub struct ExecNode {
    /// The node's qualified name.
    pub name: QualifiedName,
    /// The node kind.
    pub kind: NodeKind,
    /// The concurrency policy.
    pub concurrency: Concurrency,
    /// The declaration, including the erased callable. `None` for the source.
    pub declaration: Option<NodeDeclaration>,
    /// Producer node per input port.
    pub ports: Vec<NodeIndex>,
    /// Input index -> port index.
    pub input_ports: Vec<usize>,
    /// Predicate index -> port index.
    pub predicate_ports: Vec<usize>,
    /// For output nodes: `(label, type tag)` of every recorded product.
    pub output_items: Vec<(String, String)>,
}

/// The fully wired executor graph. Read-only after the builder completes.
#[derive(Debug)]
pub struct ExecutorGraph {
    /// Structural graph (nodes, port-addressed edges).
    pub graph: FlowGraph,
    /// Wired nodes, indexed like the graph. Index 0 is the source.
    pub nodes: Vec<Arc<ExecNode>>,
    /// Deterministic topological order.
    pub order: Vec<NodeIndex>,
    /// Name of the root source.
    pub source_name: String,
    /// Child level name -> splitter node that injects it.
    pub splitter_levels: HashMap<String, NodeIndex>,
    /// Per splitter: per node: which input ports lie downstream of it. Used
    /// to scope the flush barrier of splitter-injected levels.
    pub flush_masks: HashMap<NodeIndex, Vec<Vec<bool>>>,
}

impl ExecutorGraph {
    /// The ports of `node` that participate in the barrier for a flush at
    /// `level_name`. Ports not downstream of a splitter-injected level never
    /// see its flushes and are exempt.
    #[must_use]
    pub fn flush_ports(&self, node: NodeIndex, level_name: &str) -> Vec<usize> {
        let port_count = self.nodes[node].ports.len();
        match self.splitter_levels.get(level_name) {
            Some(&splitter) => self.flush_masks[&splitter][node]
                .iter()
                .enumerate()
                .filter_map(|(port, covered)| covered.then_some(port))
                .collect(),
            None => (0..port_count).collect(),
        }
    }
}

struct Producer {
    spec: ProductSpecification,
    node: NodeIndex,
    name: QualifiedName,
    type_tag: String,
}

/// Collects declarations and wires them against one root source.
pub struct GraphBuilder {
    source_name: String,
    source_provides: Vec<OutputSpec>,
    declarations: Vec<NodeDeclaration>,
}

impl GraphBuilder {
    /// Create a builder wired to `source`.
    #[must_use]
    pub fn new(source: &dyn RecordSource) -> Self {
        Self {
            source_name: source.name().to_string(),
            source_provides: source.provides(),
            declarations: Vec::new(),
        }
    }

    /// Add a module's declarations.
    ///
    /// # Errors
    /// Propagates registration errors from
    /// [`Module::into_declarations`].
    pub fn add_module(&mut self, module: Module) -> Result<&mut Self> {
        self.declarations.extend(module.into_declarations()?);
        Ok(self)
    }

    /// Add pre-built declarations.
    pub fn add_declarations(&mut self, declarations: Vec<NodeDeclaration>) -> &mut Self {
        self.declarations.extend(declarations);
        self
    }

    /// Resolve all wiring and build the executor graph.
    ///
    /// Deterministic given the same declarations: node indices follow
    /// declaration order, ports follow query order.
    ///
    /// # Errors
    /// Returns the wiring errors of spec resolution:
    /// [`CascadeError::DuplicateSpecification`],
    /// [`CascadeError::UnresolvedInput`], [`CascadeError::AmbiguousInput`],
    /// [`CascadeError::CycleDetected`], [`CascadeError::TypeMismatch`] (a
    /// predicate resolving to a non-boolean producer), or
    /// [`CascadeError::Configuration`].
    pub fn build(self) -> Result<ExecutorGraph> {
        let source_qualified = QualifiedName::new(SOURCE_MODULE, self.source_name.clone());

        // 1. Producer map over all declared outputs.
        let mut producers: Vec<Producer> = Vec::new();
        for spec in &self.source_provides {
            register_producer(&mut producers, spec, 0, &source_qualified)?;
        }
        for (i, decl) in self.declarations.iter().enumerate() {
            for spec in decl.outputs() {
                register_producer(&mut producers, spec, i + 1, decl.name())?;
            }
        }

        // 2./3. Resolve queries and predicates; assign ports; collect edges.
        let mut graph = FlowGraph::new();
        graph.add_node(GraphNode {
            name: source_qualified.clone(),
            kind: NodeKind::Source,
            concurrency: Concurrency::Serial,
        });
        for decl in &self.declarations {
            graph.add_node(GraphNode {
                name: decl.name().clone(),
                kind: decl.kind(),
                concurrency: decl.concurrency(),
            });
        }

        let mut splitter_levels: HashMap<String, NodeIndex> = HashMap::new();
        let mut nodes: Vec<ExecNode> = Vec::with_capacity(self.declarations.len() + 1);
        nodes.push(ExecNode {
            name: source_qualified,
            kind: NodeKind::Source,
            concurrency: Concurrency::Serial,
            declaration: None,
            ports: Vec::new(),
            input_ports: Vec::new(),
            predicate_ports: Vec::new(),
            output_items: Vec::new(),
        });

        for (i, decl) in self.declarations.iter().enumerate() {
            let consumer = i + 1;
            let mut ports: Vec<NodeIndex> = Vec::new();
            let mut port_of = |ports: &mut Vec<NodeIndex>, producer: NodeIndex| -> usize {
                match ports.iter().position(|&p| p == producer) {
                    Some(port) => port,
                    None => {
                        ports.push(producer);
                        ports.len() - 1
                    }
                }
            };

            let mut input_ports = Vec::with_capacity(decl.inputs().len());
            let mut output_items = Vec::new();
            for query in decl.inputs() {
                let producer = resolve(&producers, decl.name(), query)?;
                input_ports.push(port_of(&mut ports, producer.node));
                if decl.kind() == NodeKind::Output {
                    output_items.push((query.label().to_string(), producer.type_tag.clone()));
                }
            }

            let mut predicate_ports = Vec::with_capacity(decl.predicates().len());
            for query in decl.predicates() {
                let producer = resolve(&producers, decl.name(), query)?;
                if producer.type_tag != std::any::type_name::<bool>() {
                    return Err(CascadeError::TypeMismatch {
                        product: query.label().to_string(),
                        requested: std::any::type_name::<bool>().to_string(),
                        available: producer.type_tag.clone(),
                    });
                }
                predicate_ports.push(port_of(&mut ports, producer.node));
            }

            for (port, &producer) in ports.iter().enumerate() {
                graph.add_edge(Edge {
                    from: producer,
                    to: consumer,
                    port,
                });
            }

            if decl.kind() == NodeKind::Splitter {
                let level = decl.level.clone().unwrap_or_default();
                if let Some(previous) = splitter_levels.insert(level.clone(), consumer) {
                    return Err(CascadeError::Configuration {
                        cause: format!(
                            "splitters '{}' and '{}' both inject level '{level}'",
                            nodes[previous].name,
                            decl.name()
                        ),
                    });
                }
            }

            nodes.push(ExecNode {
                name: decl.name().clone(),
                kind: decl.kind(),
                concurrency: decl.concurrency(),
                declaration: None,
                ports,
                input_ports,
                predicate_ports,
                output_items,
            });
        }

        // Attach declarations (moved out of self after the borrow-heavy pass).
        for (i, decl) in self.declarations.into_iter().enumerate() {
            nodes[i + 1].declaration = Some(decl);
        }

        // 4./5. Reject cycles, compute the execution order.
        let order = graph.topological_sort()?;

        // 6. Flush scoping for splitter-injected levels.
        let mut flush_masks = HashMap::new();
        for &splitter in splitter_levels.values() {
            let mut reached = vec![false; graph.len()];
            reached[splitter] = true;
            let mut queue: VecDeque<NodeIndex> = VecDeque::from([splitter]);
            while let Some(node) = queue.pop_front() {
                for edge in graph.outgoing_edges(node) {
                    if !reached[edge.to] {
                        reached[edge.to] = true;
                        queue.push_back(edge.to);
                    }
                }
            }
            let masks: Vec<Vec<bool>> = nodes
                .iter()
                .map(|node| node.ports.iter().map(|&p| reached[p]).collect())
                .collect();
            flush_masks.insert(splitter, masks);
        }

        Ok(ExecutorGraph {
            graph,
            nodes: nodes.into_iter().map(Arc::new).collect(),
            order,
            source_name: self.source_name,
            splitter_levels,
            flush_masks,
        })
    }
}

fn register_producer(
    producers: &mut Vec<Producer>,
    spec: &OutputSpec,
    node: NodeIndex,
    name: &QualifiedName,
) -> Result<()> {
    if let Some(existing) = producers.iter().find(|p| p.spec == spec.spec) {
        return Err(CascadeError::DuplicateSpecification {
            spec: spec.spec.to_string(),
            first: existing.name.to_string(),
            second: name.to_string(),
        });
    }
    producers.push(Producer {
        spec: spec.spec.clone(),
        node,
        name: name.clone(),
        type_tag: spec.type_tag.clone(),
    });
    Ok(())
}

fn resolve<'p>(
    producers: &'p [Producer],
    consumer: &QualifiedName,
    query: &ProductQuery,
) -> Result<&'p Producer> {
    let mut matches = producers.iter().filter(|p| query.matches(&p.spec));
    let Some(first) = matches.next() else {
        return Err(CascadeError::UnresolvedInput {
            node: consumer.to_string(),
            query: query.to_string(),
        });
    };
    if let Some(second) = matches.next() {
        return Err(CascadeError::AmbiguousInput {
            node: consumer.to_string(),
            query: query.to_string(),
            first: first.name.to_string(),
            second: second.name.to_string(),
        });
    }
    Ok(first)
}

/// Container layout (`label` -> type tag) an output node will create.
#[must_use]
pub fn container_layout(node: &ExecNode) -> BTreeMap<String, String> {
    node.output_items.iter().cloned().collect()
}
