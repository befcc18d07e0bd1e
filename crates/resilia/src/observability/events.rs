//! Lifecycle events and observer implementations

use std::fmt::Debug;
use std::sync::Arc;
use std::time::SystemTime;

use tracing::{debug, info, warn};

use super::traits::MetricsCollector;
use crate::resilience::CircuitState;

/// A lifecycle transition inside a bulkhead or circuit breaker
#[derive(Debug, Clone, PartialEq)]
pub enum ResilienceEvent {
    /// A caller joined the bulkhead queue
    Queued { queue_length: usize },
    /// A caller was admitted to run
    Accepted { active_count: usize },
    /// An admitted task finished (successfully or not)
    ///
    /// `active_count` is read once the slot is freed, before it is handed to
    /// the next queued caller.
    Completed { active_count: usize },
    /// Admission refused because the queue was full
    Rejected { total_rejected: u64 },
    /// A queued caller gave up after the wait timeout
    TimedOut { total_rejected: u64 },
    /// The circuit breaker moved between states
    StateChanged { from: CircuitState, to: CircuitState, timestamp: SystemTime },
}

impl ResilienceEvent {
    /// Stable event name, suitable for metric names and log fields
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Queued { .. } => "request:queued",
            Self::Accepted { .. } => "request:accepted",
            Self::Completed { .. } => "request:completed",
            Self::Rejected { .. } => "request:rejected",
            Self::TimedOut { .. } => "request:timeout",
            Self::StateChanged { .. } => "state:changed",
        }
    }
}

/// Receives lifecycle events from breakers and bulkheads
///
/// `resource` is the name of the protected operation the emitting component
/// belongs to (its [`crate::OperationKey`] when created by a pipeline).
pub trait ResilienceObserver: Send + Sync + Debug {
    /// Handle one event
    fn on_event(&self, resource: &str, event: &ResilienceEvent);
}

/// Observer shared between the components of a pipeline
pub type SharedObserver = Arc<dyn ResilienceObserver>;

/// Observer that discards every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpObserver;

impl ResilienceObserver for NoOpObserver {
    fn on_event(&self, _resource: &str, _event: &ResilienceEvent) {
        // No-op
    }
}

/// Observer that turns events into structured `tracing` events
///
/// Queue churn is logged at debug, refusals at warn and breaker transitions at
/// warn (tripping) or info (probing, recovery).
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ResilienceObserver for TracingObserver {
    fn on_event(&self, resource: &str, event: &ResilienceEvent) {
        match event {
            ResilienceEvent::Queued { queue_length } => {
                debug!(resource, queue_length, "Bulkhead: request queued");
            }
            ResilienceEvent::Accepted { active_count } => {
                debug!(resource, active_count, "Bulkhead: request accepted");
            }
            ResilienceEvent::Completed { active_count } => {
                debug!(resource, active_count, "Bulkhead: request completed");
            }
            ResilienceEvent::Rejected { total_rejected } => {
                warn!(resource, total_rejected, "Bulkhead: rejected, queue full");
            }
            ResilienceEvent::TimedOut { total_rejected } => {
                warn!(resource, total_rejected, "Bulkhead: timed out waiting for a slot");
            }
            ResilienceEvent::StateChanged { from, to, .. } => match to {
                CircuitState::Open => {
                    warn!(resource, %from, %to, "Circuit breaker state changed");
                }
                CircuitState::HalfOpen | CircuitState::Closed => {
                    info!(resource, %from, %to, "Circuit breaker state changed");
                }
            },
        }
    }
}

/// Observer that feeds a [`MetricsCollector`]
///
/// Every event increments `resilia_events_total{resource, event}`. Bulkhead
/// events also update the `resilia_bulkhead_active` / `resilia_bulkhead_queued`
/// gauges and breaker transitions update `resilia_circuit_state`
/// (0 closed, 1 half-open, 2 open).
#[derive(Debug, Clone, Default)]
pub struct MetricsObserver<M> {
    collector: M,
}

impl<M: MetricsCollector> MetricsObserver<M> {
    pub const fn new(collector: M) -> Self {
        Self { collector }
    }

    pub const fn collector(&self) -> &M {
        &self.collector
    }
}

impl<M: MetricsCollector> ResilienceObserver for MetricsObserver<M> {
    fn on_event(&self, resource: &str, event: &ResilienceEvent) {
        let labels = [("resource", resource), ("event", event.name())];
        self.collector.increment_counter("resilia_events_total", &labels);

        let resource_label = [("resource", resource)];
        match event {
            ResilienceEvent::Queued { queue_length } => {
                self.collector.record_gauge(
                    "resilia_bulkhead_queued",
                    *queue_length as f64,
                    &resource_label,
                );
            }
            ResilienceEvent::Accepted { active_count }
            | ResilienceEvent::Completed { active_count } => {
                self.collector.record_gauge(
                    "resilia_bulkhead_active",
                    *active_count as f64,
                    &resource_label,
                );
            }
            ResilienceEvent::Rejected { .. } | ResilienceEvent::TimedOut { .. } => {}
            ResilienceEvent::StateChanged { to, .. } => {
                let value = match to {
                    CircuitState::Closed => 0.0,
                    CircuitState::HalfOpen => 1.0,
                    CircuitState::Open => 2.0,
                };
                self.collector.record_gauge("resilia_circuit_state", value, &resource_label);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    struct CapturingCollector {
        counters: Mutex<Vec<(String, Vec<(String, String)>)>>,
        gauges: Mutex<Vec<(String, f64)>>,
    }

    impl MetricsCollector for CapturingCollector {
        fn increment_counter(&self, name: &str, labels: &[(&str, &str)]) {
            let labels = labels.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
            self.counters.lock().push((name.to_string(), labels));
        }

        fn record_gauge(&self, name: &str, value: f64, _labels: &[(&str, &str)]) {
            self.gauges.lock().push((name.to_string(), value));
        }
    }

    #[test]
    fn test_event_names() {
        assert_eq!(ResilienceEvent::Queued { queue_length: 1 }.name(), "request:queued");
        assert_eq!(ResilienceEvent::TimedOut { total_rejected: 1 }.name(), "request:timeout");
        let changed = ResilienceEvent::StateChanged {
            from: CircuitState::Closed,
            to: CircuitState::Open,
            timestamp: SystemTime::UNIX_EPOCH,
        };
        assert_eq!(changed.name(), "state:changed");
    }

    #[test]
    fn test_metrics_observer_counts_and_gauges() {
        let observer = MetricsObserver::new(CapturingCollector::default());

        observer.on_event("UserService::get", &ResilienceEvent::Accepted { active_count: 2 });
        observer.on_event(
            "UserService::get",
            &ResilienceEvent::StateChanged {
                from: CircuitState::Closed,
                to: CircuitState::Open,
                timestamp: SystemTime::UNIX_EPOCH,
            },
        );

        let counters = observer.collector().counters.lock();
        assert_eq!(counters.len(), 2);
        assert!(counters[0].1.contains(&("event".to_string(), "request:accepted".to_string())));

        let gauges = observer.collector().gauges.lock();
        assert_eq!(gauges[0], ("resilia_bulkhead_active".to_string(), 2.0));
        assert_eq!(gauges[1], ("resilia_circuit_state".to_string(), 2.0));
    }

    #[test]
    fn test_noop_and_tracing_observers_accept_events() {
        let event = ResilienceEvent::Rejected { total_rejected: 3 };
        NoOpObserver.on_event("svc", &event);
        TracingObserver.on_event("svc", &event);
    }
}
