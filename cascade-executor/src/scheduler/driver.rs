//! The source driver.
//!
//! Sources emit process-stage stores only; the driver derives the flush
//! markers from the identity sequence. It tracks the stack of currently open
//! stores and, whenever an emission leaves a subtree (or the source runs
//! out), closes the abandoned stores deepest-first with inserted flush
//! markers.

use cascade_core::error::{CascadeError, Result};
use cascade_core::source::RecordSource;
use cascade_core::store::StorePtr;
use cascade_core::types::LevelIdPtr;
use std::collections::HashSet;
use std::sync::Arc;

/// One routable event produced by the driver.
#[derive(Debug)]
pub enum DriverEvent {
    /// A process-stage record, routed to the source's consumers.
    Record(StorePtr),
    /// An inserted flush marker.
    Flush(StorePtr),
}

/// Wraps a [`RecordSource`] and inserts flush markers.
pub struct SourceDriver {
    source: Box<dyn RecordSource>,
    open: Vec<StorePtr>,
    closed: HashSet<LevelIdPtr>,
    exhausted: bool,
    records: u64,
    last: String,
}

impl SourceDriver {
    /// Wrap a source.
    #[must_use]
    pub fn new(source: Box<dyn RecordSource>) -> Self {
        Self {
            source,
            open: Vec::new(),
            closed: HashSet::new(),
            exhausted: false,
            records: 0,
            last: "/".to_string(),
        }
    }

    /// Whether the source has been fully drained (final flushes included).
    #[must_use]
    pub fn exhausted(&self) -> bool {
        self.exhausted
    }

    /// Number of records pulled so far.
    #[must_use]
    pub fn records(&self) -> u64 {
        self.records
    }

    /// Pull one record and return the events it implies: flushes for every
    /// subtree the emission leaves, then the newly opened records.
    ///
    /// # Errors
    /// A source error surfaces as
    /// [`CascadeError::SourceExhaustedPrematurely`]; an emission outside the
    /// open hierarchy (a flush store, or a reopened subtree) is an
    /// [`CascadeError::InternalInvariant`].
    pub fn pull(&mut self) -> Result<Vec<DriverEvent>> {
        if self.exhausted {
            return Ok(Vec::new());
        }

        let store = match self.source.next() {
            Ok(Some(store)) => store,
            Ok(None) => {
                self.exhausted = true;
                let mut events = Vec::with_capacity(self.open.len());
                while let Some(open) = self.open.pop() {
                    self.closed.insert(Arc::clone(open.id()));
                    events.push(DriverEvent::Flush(open.make_flush()));
                }
                return Ok(events);
            }
            Err(err) => {
                self.exhausted = true;
                return Err(CascadeError::SourceExhaustedPrematurely {
                    source_name: self.source.name().to_string(),
                    last: self.last.clone(),
                    cause: err.to_string(),
                });
            }
        };

        if store.is_flush() {
            self.exhausted = true;
            return Err(CascadeError::InternalInvariant {
                cause: format!(
                    "source '{}' emitted a flush store for {}; flush markers are inserted by the driver",
                    self.source.name(),
                    store.id().encode()
                ),
            });
        }

        // The store's ancestor chain, root first.
        let mut chain = Vec::with_capacity(store.id().depth() + 1);
        let mut cur = Some(&store);
        while let Some(s) = cur {
            chain.push(Arc::clone(s));
            cur = s.parent();
        }
        chain.reverse();

        // Longest common prefix with the open stack, by identity.
        let mut keep = 0;
        while keep < self.open.len()
            && keep < chain.len()
            && self.open[keep].id() == chain[keep].id()
        {
            keep += 1;
        }

        let mut events = Vec::new();
        for abandoned in self.open.split_off(keep).into_iter().rev() {
            self.closed.insert(Arc::clone(abandoned.id()));
            events.push(DriverEvent::Flush(abandoned.make_flush()));
        }

        if keep == chain.len() {
            // A continuation at the current level: routed, not re-opened.
            events.push(DriverEvent::Record(Arc::clone(&store)));
        } else {
            for opened in &chain[keep..] {
                if self.closed.contains(opened.id()) {
                    self.exhausted = true;
                    return Err(CascadeError::InternalInvariant {
                        cause: format!(
                            "source '{}' reopened closed subtree {}",
                            self.source.name(),
                            opened.id().encode()
                        ),
                    });
                }
                self.open.push(Arc::clone(opened));
                events.push(DriverEvent::Record(Arc::clone(opened)));
            }
        }

        self.records += 1;
        self.last = store.id().encode();
        Ok(events)
    }
}
