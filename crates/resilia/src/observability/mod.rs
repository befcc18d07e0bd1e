//! Observability hooks for the resilience primitives
//!
//! Breakers and bulkheads report lifecycle transitions to a
//! [`ResilienceObserver`] injected at construction. Observers are advisory:
//! they are invoked after the owning component has released its internal
//! lock and cannot influence admission decisions.
//!
//! - [`events`]: the event vocabulary and observer implementations
//! - [`traits`]: the metrics sink abstraction used by [`MetricsObserver`]

pub mod events;
pub mod traits;

pub use events::{
    MetricsObserver, NoOpObserver, ResilienceEvent, ResilienceObserver, SharedObserver,
    TracingObserver,
};
pub use traits::{MetricsCollector, NoOpMetricsCollector};
