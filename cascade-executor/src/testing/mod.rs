//! Test support: scripted sources and observation probes.

use cascade_core::declare::OutputSpec;
use cascade_core::error::{CascadeError, Result};
use cascade_core::source::RecordSource;
use cascade_core::spec::ProductSpecification;
use cascade_core::store::StorePtr;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// A source that emits a pre-scripted list of stores.
pub struct SequenceSource {
    name: String,
    provides: Vec<OutputSpec>,
    records: VecDeque<StorePtr>,
    fail_after: Option<usize>,
    emitted: usize,
}

impl SequenceSource {
    /// Create an empty scripted source.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            provides: Vec::new(),
            records: VecDeque::new(),
            fail_after: None,
            emitted: 0,
        }
    }

    /// Declare a provided product stream with the type tag of `T`.
    #[must_use]
    pub fn providing<T: 'static>(mut self, label: &str) -> Self {
        self.provides.push(OutputSpec {
            spec: ProductSpecification::create(label),
            type_tag: std::any::type_name::<T>().to_string(),
        });
        self
    }

    /// Script the emitted records.
    #[must_use]
    pub fn with_records(mut self, records: Vec<StorePtr>) -> Self {
        self.records = records.into();
        self
    }

    /// Fail with an error after `count` successful emissions.
    #[must_use]
    pub fn failing_after(mut self, count: usize) -> Self {
        self.fail_after = Some(count);
        self
    }
}

impl RecordSource for SequenceSource {
    fn name(&self) -> &str {
        &self.name
    }

    fn provides(&self) -> Vec<OutputSpec> {
        self.provides.clone()
    }

    fn next(&mut self) -> Result<Option<StorePtr>> {
        if let Some(limit) = self.fail_after {
            if self.emitted >= limit {
                return Err(CascadeError::Configuration {
                    cause: "scripted source failure".to_string(),
                });
            }
        }
        let record = self.records.pop_front();
        if record.is_some() {
            self.emitted += 1;
        }
        Ok(record)
    }
}

/// A thread-safe observation sink for asserting end-to-end results.
pub struct Probe<T> {
    values: Arc<Mutex<Vec<T>>>,
}

impl<T> Probe<T> {
    /// Create an empty probe.
    #[must_use]
    pub fn new() -> Self {
        Self {
            values: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Record one observation.
    pub fn record(&self, value: T) {
        self.values.lock().push(value);
    }

    /// Number of recorded observations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.values.lock().len()
    }

    /// Check whether the probe is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.values.lock().is_empty()
    }
}

impl<T: Clone> Probe<T> {
    /// Snapshot the recorded observations.
    #[must_use]
    pub fn values(&self) -> Vec<T> {
        self.values.lock().clone()
    }

    /// Snapshot the observations in sorted order.
    #[must_use]
    pub fn sorted(&self) -> Vec<T>
    where
        T: Ord,
    {
        let mut values = self.values();
        values.sort();
        values
    }
}

impl<T> Clone for Probe<T> {
    fn clone(&self) -> Self {
        Self {
            values: Arc::clone(&self.values),
        }
    }
}

impl<T> Default for Probe<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Tracks concurrent entries into instrumented callables, recording the peak.
pub struct ConcurrencyProbe {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyProbe {
    /// Create a probe with zero entries.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            current: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        })
    }

    /// Mark entry into an invocation.
    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    /// Mark exit from an invocation.
    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    /// The highest number of overlapping invocations observed.
    #[must_use]
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cascade_core::product::Products;
    use cascade_core::store::ProductStore;

    #[test]
    fn sequence_source_drains_in_order() {
        let base = ProductStore::base();
        let first = base.make_child(0, "cell", "gen", Products::new()).unwrap();
        let second = base.make_child(1, "cell", "gen", Products::new()).unwrap();
        let mut source = SequenceSource::new("gen").with_records(vec![first, second]);

        assert_eq!(source.next().unwrap().unwrap().id().encode(), "/cell:0");
        assert_eq!(source.next().unwrap().unwrap().id().encode(), "/cell:1");
        assert!(source.next().unwrap().is_none());
    }

    #[test]
    fn concurrency_probe_tracks_peak() {
        let probe = ConcurrencyProbe::new();
        probe.enter();
        probe.enter();
        probe.exit();
        probe.enter();
        assert_eq!(probe.peak(), 2);
    }
}
