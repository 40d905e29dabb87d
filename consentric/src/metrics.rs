//! Metrics sink port. Backends are external collaborators; this crate only
//! emits named counters at the points the lifecycle flows require.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

/// Sink for operational counters.
pub trait MetricsSink: Send + Sync {
    /// Increments the named counter by 1.
    fn increment(&self, name: &'static str);
}

/// Sink that emits counters as structured log events.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment(&self, name: &'static str) {
        tracing::debug!(counter = name, "metric incremented");
    }
}

/// Sink that keeps counts in memory, for tests and demos.
#[derive(Debug, Default)]
pub struct CountingMetrics {
    counts: Mutex<HashMap<&'static str, u64>>,
}

impl CountingMetrics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the current value of the named counter.
    pub fn count(&self, name: &str) -> u64 {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .copied()
            .unwrap_or(0)
    }
}

impl MetricsSink for CountingMetrics {
    fn increment(&self, name: &'static str) {
        *self
            .counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(name)
            .or_insert(0) += 1;
    }
}
