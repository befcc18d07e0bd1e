//! Metrics sink abstraction
//!
//! Lets [`super::MetricsObserver`] feed counters and gauges into whatever
//! metrics backend the embedding application already runs, without this crate
//! depending on one.

use std::fmt::Debug;

/// Trait for metrics collection implementations
pub trait MetricsCollector: Send + Sync + Debug {
    /// Record a counter metric
    fn increment_counter(&self, name: &str, labels: &[(&str, &str)]);

    /// Record a gauge metric
    fn record_gauge(&self, name: &str, value: f64, labels: &[(&str, &str)]);
}

/// No-op metrics collector for testing or when metrics are disabled
#[derive(Debug, Clone, Default)]
pub struct NoOpMetricsCollector;

impl MetricsCollector for NoOpMetricsCollector {
    fn increment_counter(&self, _name: &str, _labels: &[(&str, &str)]) {
        // No-op
    }

    fn record_gauge(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {
        // No-op
    }
}
