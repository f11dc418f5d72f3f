//! Input joins keyed on record identity.
//!
//! Every non-source node owns one join: a multi-input port set where each
//! port is fed by one upstream producer. A record fires when every port holds
//! a message for the same record identity, matched along the ancestor chain:
//! the joined identities must lie on one root-to-leaf path, and the join key
//! is the most-derived of them. A message at an ancestor level (a run-level
//! product, say) therefore pairs with every descendant record below it; such
//! messages are retained per port until their subtree's flush arrives.
//!
//! Flush markers join separately: they are never handed to user callables,
//! and the barrier only completes once every participating port has
//! delivered the marker. A flush is held while a tuple inside its subtree
//! can still complete; the enclosing flush purges such strands, which is
//! what bounds the buffers.

use cascade_core::store::StorePtr;
use cascade_core::types::LevelIdPtr;
use std::sync::Arc;

/// A completed join: one store per port, all on one ancestor chain.
#[derive(Debug)]
pub struct ReadyTuple {
    /// The record identity: the most-derived joined identity.
    pub key: LevelIdPtr,
    /// The joined stores, indexed by port.
    pub stores: Vec<StorePtr>,
}

#[derive(Debug)]
struct PartialTuple {
    slots: Vec<Option<StorePtr>>,
}

impl PartialTuple {
    /// The tuple's current key: the deepest filled identity.
    fn key(&self) -> Option<LevelIdPtr> {
        let mut best: Option<&LevelIdPtr> = None;
        for store in self.slots.iter().flatten() {
            let id = store.id();
            if best.map_or(true, |b| id.depth() > b.depth()) {
                best = Some(id);
            }
        }
        best.map(Arc::clone)
    }

    fn complete(&self) -> bool {
        self.slots.iter().all(Option::is_some)
    }

    fn into_ready(self) -> Option<ReadyTuple> {
        let key = self.key()?;
        let stores: Vec<StorePtr> = self.slots.into_iter().flatten().collect();
        Some(ReadyTuple { key, stores })
    }
}

#[derive(Debug)]
struct FlushWait {
    store: StorePtr,
    seen: Vec<bool>,
    required: Vec<usize>,
}

impl FlushWait {
    fn complete(&self) -> bool {
        self.required.iter().all(|&port| self.seen[port])
    }
}

/// Join buffer of one node.
#[derive(Debug)]
pub struct InputJoin {
    arity: usize,
    /// Partial tuples in arrival order. A producer may emit several stores
    /// with one identity (continuations); extra messages open further tuples.
    tuples: Vec<PartialTuple>,
    /// Per port: messages retained for ancestor-chain pairing. An entry is
    /// dropped when the flush for its own identity is removed.
    retained: Vec<Vec<StorePtr>>,
    flushes: Vec<FlushWait>,
}

impl InputJoin {
    /// Create a join with one slot per input port.
    #[must_use]
    pub fn new(arity: usize) -> Self {
        Self {
            arity,
            tuples: Vec::new(),
            retained: vec![Vec::new(); arity],
            flushes: Vec::new(),
        }
    }

    /// Number of input ports.
    #[must_use]
    pub fn arity(&self) -> usize {
        self.arity
    }

    /// Deliver a process-stage message on `port`. Returns every tuple this
    /// message completed.
    ///
    /// A message strictly above a tuple's key fills that slot in every such
    /// tuple (an ancestor product serves all its descendants); a message at
    /// or below a tuple's key is a specific record and fills at most one
    /// tuple. A message that fills no tuple opens a new one, pre-filled per
    /// port with the deepest retained message strictly above it.
    pub fn deliver(&mut self, port: usize, store: StorePtr) -> Vec<ReadyTuple> {
        let id = Arc::clone(store.id());
        self.retained[port].push(Arc::clone(&store));

        let mut consumed = false;
        for tuple in &mut self.tuples {
            if tuple.slots[port].is_some() {
                continue;
            }
            let Some(key) = tuple.key() else {
                continue;
            };
            let strictly_above = id.encloses(&key) && *id != *key;
            if strictly_above {
                tuple.slots[port] = Some(Arc::clone(&store));
            } else if !consumed && id.related(&key) {
                tuple.slots[port] = Some(Arc::clone(&store));
                consumed = true;
            }
        }

        if !consumed {
            let mut slots: Vec<Option<StorePtr>> = vec![None; self.arity];
            slots[port] = Some(store);
            for (other, slot) in slots.iter_mut().enumerate() {
                if other == port {
                    continue;
                }
                let mut best: Option<&StorePtr> = None;
                for candidate in &self.retained[other] {
                    let cid = candidate.id();
                    if cid.encloses(&id)
                        && **cid != *id
                        && best.map_or(true, |b| cid.depth() > b.id().depth())
                    {
                        best = Some(candidate);
                    }
                }
                *slot = best.cloned();
            }
            self.tuples.push(PartialTuple { slots });
        }

        let mut ready = Vec::new();
        let mut i = 0;
        while i < self.tuples.len() {
            if self.tuples[i].complete() {
                if let Some(tuple) = self.tuples.remove(i).into_ready() {
                    ready.push(tuple);
                }
            } else {
                i += 1;
            }
        }
        ready
    }

    /// Deliver a flush marker on `port`. `required` lists the ports that
    /// participate in this marker's barrier.
    pub fn deliver_flush(&mut self, port: usize, store: &StorePtr, required: &[usize]) {
        let id = store.id();
        if let Some(wait) = self.flushes.iter_mut().find(|w| w.store.id() == id) {
            wait.seen[port] = true;
            return;
        }
        let mut seen = vec![false; self.arity];
        seen[port] = true;
        self.flushes.push(FlushWait {
            store: Arc::clone(store),
            seen,
            required: required.to_vec(),
        });
    }

    /// Identities of flush markers whose barrier is complete.
    #[must_use]
    pub fn completed_flushes(&self) -> Vec<StorePtr> {
        self.flushes
            .iter()
            .filter(|w| w.complete())
            .map(|w| Arc::clone(&w.store))
            .collect()
    }

    /// Remove a forwarded flush and drop the retained messages of its level.
    pub fn remove_flush(&mut self, id: &LevelIdPtr) {
        self.flushes.retain(|w| w.store.id() != id);
        for port in &mut self.retained {
            port.retain(|store| store.id() != id);
        }
    }

    /// Drop partial tuples keyed strictly inside `id`'s subtree, returning
    /// how many were dropped. A tuple keyed at `id` itself is kept: an
    /// ancestor-level partner may still complete it. Unmatched buffers are
    /// resolved by the enclosing flush.
    pub fn purge_below(&mut self, id: &LevelIdPtr) -> usize {
        let before = self.tuples.len();
        self.tuples.retain(|tuple| match tuple.key() {
            Some(key) => !(id.encloses(&key) && **id != *key),
            None => false,
        });
        before - self.tuples.len()
    }

    /// Drop partial tuples keyed at or inside `id`'s subtree, returning how
    /// many were dropped. Used when a record is poisoned: its tuples can
    /// never fire.
    pub fn purge_subtree(&mut self, id: &LevelIdPtr) -> usize {
        let before = self.tuples.len();
        self.tuples.retain(|tuple| match tuple.key() {
            Some(key) => !id.encloses(&key),
            None => false,
        });
        before - self.tuples.len()
    }

    /// Check for partial tuples keyed at or inside `id`'s subtree. A flush
    /// must not be forwarded while one exists: the tuple may still complete
    /// from an ancestor-level partner and fire.
    #[must_use]
    pub fn has_pending_under(&self, id: &LevelIdPtr) -> bool {
        self.tuples
            .iter()
            .any(|tuple| tuple.key().is_some_and(|key| id.encloses(&key)))
    }

    /// Check for an unforwarded flush marker strictly inside `id`'s subtree.
    /// Inner flushes are forwarded before enclosing ones.
    #[must_use]
    pub fn has_deeper_flush(&self, id: &LevelIdPtr) -> bool {
        self.flushes.iter().any(|w| {
            let wid = w.store.id();
            id.encloses(wid) && **id != **wid
        })
    }

    /// Number of buffered partial tuples (for diagnostics and tests).
    #[must_use]
    pub fn pending_tuples(&self) -> usize {
        self.tuples.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::product::Products;
    use cascade_core::store::ProductStore;

    fn cell(number: usize) -> StorePtr {
        ProductStore::base()
            .make_child(number, "cell", "test", Products::new())
            .unwrap()
    }

    fn run_and_events(events: usize) -> (StorePtr, Vec<StorePtr>) {
        let run = ProductStore::base()
            .make_child(0, "run", "test", Products::new())
            .unwrap();
        let events = (0..events)
            .map(|e| run.make_child(e, "event", "test", Products::new()).unwrap())
            .collect();
        (run, events)
    }

    #[test]
    fn single_port_fires_immediately() {
        let mut join = InputJoin::new(1);
        let ready = join.deliver(0, cell(0));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].key.encode(), "/cell:0");
        assert_eq!(ready[0].stores.len(), 1);
        assert_eq!(join.pending_tuples(), 0);
    }

    #[test]
    fn two_ports_join_on_identity() {
        let mut join = InputJoin::new(2);
        assert!(join.deliver(0, cell(0)).is_empty());
        assert!(join.deliver(0, cell(1)).is_empty());
        // Identity 1 on port 1 pairs with identity 1 on port 0.
        let ready = join.deliver(1, cell(1));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].key.encode(), "/cell:1");

        let ready = join.deliver(1, cell(0));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].key.encode(), "/cell:0");
        assert_eq!(join.pending_tuples(), 0);
    }

    #[test]
    fn repeated_identity_on_one_port_queues() {
        let mut join = InputJoin::new(2);
        let first = cell(0);
        let second = first.make_continuation("again", Products::new());
        assert!(join.deliver(0, first).is_empty());
        assert!(join.deliver(0, second).is_empty());
        assert_eq!(join.deliver(1, cell(0)).len(), 1);
        // The second continuation still waits for a partner.
        assert_eq!(join.pending_tuples(), 1);
    }

    #[test]
    fn ancestor_message_pairs_with_every_later_descendant() {
        let (run, events) = run_and_events(2);
        let mut join = InputJoin::new(2);

        assert!(join.deliver(0, run).is_empty());

        let ready = join.deliver(1, Arc::clone(&events[0]));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].key.encode(), "/run:0/event:0");
        assert_eq!(ready[0].stores[0].id().encode(), "/run:0");

        // The run-level message is retained and serves the next event too.
        let ready = join.deliver(1, Arc::clone(&events[1]));
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].key.encode(), "/run:0/event:1");
        assert_eq!(ready[0].stores[0].id().encode(), "/run:0");
    }

    #[test]
    fn late_ancestor_completes_all_waiting_descendants() {
        let (run, events) = run_and_events(2);
        let mut join = InputJoin::new(2);

        assert!(join.deliver(1, Arc::clone(&events[0])).is_empty());
        assert!(join.deliver(1, Arc::clone(&events[1])).is_empty());
        assert_eq!(join.pending_tuples(), 2);

        let ready = join.deliver(0, Arc::clone(&run));
        let mut keys: Vec<String> = ready.iter().map(|r| r.key.encode()).collect();
        keys.sort();
        assert_eq!(keys, vec!["/run:0/event:0", "/run:0/event:1"]);

        // The ancestor also opens its own tuple for a same-level partner;
        // the enclosing flush purges it.
        assert_eq!(join.pending_tuples(), 1);
        let base = cascade_core::types::LevelId::base();
        assert_eq!(join.purge_below(&base), 1);
        assert_eq!(join.pending_tuples(), 0);
    }

    #[test]
    fn descendants_fire_exactly_once_regardless_of_order() {
        let (run, events) = run_and_events(3);

        // Interleave: one event before the ancestor, two after.
        let mut join = InputJoin::new(2);
        let mut fired = 0;
        fired += join.deliver(1, Arc::clone(&events[0])).len();
        fired += join.deliver(0, Arc::clone(&run)).len();
        fired += join.deliver(1, Arc::clone(&events[1])).len();
        fired += join.deliver(1, Arc::clone(&events[2])).len();
        assert_eq!(fired, 3);
    }

    #[test]
    fn flush_barrier_requires_all_listed_ports() {
        let mut join = InputJoin::new(2);
        let flush = cell(0).make_flush();
        join.deliver_flush(0, &flush, &[0, 1]);
        assert!(join.completed_flushes().is_empty());
        join.deliver_flush(1, &flush, &[0, 1]);
        assert_eq!(join.completed_flushes().len(), 1);
    }

    #[test]
    fn flush_barrier_ignores_exempt_ports() {
        let mut join = InputJoin::new(2);
        let flush = cell(0).make_flush();
        join.deliver_flush(1, &flush, &[1]);
        assert_eq!(join.completed_flushes().len(), 1);
    }

    #[test]
    fn own_flush_keeps_a_tuple_enclosing_flush_purges_it() {
        let (run, events) = run_and_events(1);
        let mut join = InputJoin::new(2);

        assert!(join.deliver(1, Arc::clone(&events[0])).is_empty());
        assert_eq!(join.pending_tuples(), 1);

        // The event's own flush must not drop the tuple: a run- or job-level
        // partner can still arrive on the other port.
        let event_id = Arc::clone(events[0].id());
        assert_eq!(join.purge_below(&event_id), 0);
        assert!(join.has_pending_under(&event_id));

        let run_id = Arc::clone(run.id());
        assert_eq!(join.purge_below(&run_id), 1);
        assert!(!join.has_pending_under(&run_id));
    }

    #[test]
    fn poisoned_subtrees_purge_inclusively() {
        let (_, events) = run_and_events(1);
        let mut join = InputJoin::new(2);

        assert!(join.deliver(1, Arc::clone(&events[0])).is_empty());
        let event_id = Arc::clone(events[0].id());
        assert_eq!(join.purge_subtree(&event_id), 1);
        assert_eq!(join.pending_tuples(), 0);
    }

    #[test]
    fn deeper_flush_waits_block_shallower_ones() {
        let (run, events) = run_and_events(1);
        let mut join = InputJoin::new(1);

        let event_flush = events[0].make_flush();
        let run_flush = run.make_flush();
        join.deliver_flush(0, &event_flush, &[0]);
        join.deliver_flush(0, &run_flush, &[0]);

        let run_id = Arc::clone(run_flush.id());
        assert!(join.has_deeper_flush(&run_id));

        let event_id = Arc::clone(event_flush.id());
        join.remove_flush(&event_id);
        assert!(!join.has_deeper_flush(&run_id));
    }

    #[test]
    fn remove_flush_drops_retained_messages_of_its_level() {
        let (run, events) = run_and_events(2);
        let mut join = InputJoin::new(2);

        // The run-level message serves event 0 via retention.
        assert!(join.deliver(0, Arc::clone(&run)).is_empty());
        assert_eq!(join.deliver(1, Arc::clone(&events[0])).len(), 1);

        // After the run's flush is removed, its retained message is gone and
        // a late descendant can no longer pair with it.
        let run_id = Arc::clone(run.id());
        assert_eq!(join.purge_below(&run_id), 0);
        join.remove_flush(&run_id);
        assert!(join.deliver(1, Arc::clone(&events[1])).is_empty());
    }
}
