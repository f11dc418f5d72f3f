//! The concurrent scheduler.
//!
//! This module drives records through the wired graph:
//! - [`SourceDriver`] - pulls the root source and inserts flush markers
//! - [`InputJoin`] - per-node joins keyed on record identity
//! - [`PipelineExecutor`] - the execution loop with per-node concurrency,
//!   flush barriers, reductions, poisoning, and cancellation

mod driver;
mod executor;
mod join;

pub use driver::{DriverEvent, SourceDriver};
pub use executor::{ExecutionSummary, PipelineExecutor};
pub use join::{InputJoin, ReadyTuple};

/// Configuration for the executor.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Soft bound on concurrently in-flight firings. The source is paced so
    /// that roughly this many invocations are outstanding; per-node
    /// concurrency policies are enforced on top with fair semaphores.
    pub max_concurrent_firings: usize,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let parallelism = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        Self {
            max_concurrent_firings: parallelism * 4,
        }
    }
}

impl ExecutorConfig {
    /// Create configuration from environment variables.
    ///
    /// Reads `CASCADE_MAX_CONCURRENT_FIRINGS`; unset or unparsable values
    /// fall back to the default.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let max_concurrent_firings = std::env::var("CASCADE_MAX_CONCURRENT_FIRINGS")
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(defaults.max_concurrent_firings);
        Self {
            max_concurrent_firings,
        }
    }

    /// Set the in-flight firing bound.
    #[must_use]
    pub fn with_max_concurrent_firings(mut self, max: usize) -> Self {
        self.max_concurrent_firings = max.max(1);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_bound_is_positive() {
        assert!(ExecutorConfig::default().max_concurrent_firings > 0);
    }

    #[test]
    fn builder_clamps_to_one() {
        let config = ExecutorConfig::default().with_max_concurrent_firings(0);
        assert_eq!(config.max_concurrent_firings, 1);
    }
}
