//! Composable fault tolerance for asynchronous work.
//!
//! `resilia` wraps an arbitrary async unit of work with three independent
//! protections and composes them per protected operation:
//!
//! - **Circuit breaker**: stops calling a dependency whose recent failure rate
//!   crosses a threshold, then probes for recovery after a sleep window
//! - **Bulkhead**: caps concurrent executions and parks excess callers in a
//!   bounded FIFO queue with a per-wait timeout
//! - **Retry**: re-attempts failures with capped, full-jitter exponential
//!   backoff
//!
//! The [`ResiliencePipeline`] owns one breaker/bulkhead pair per
//! [`OperationKey`] and always nests them as
//! `breaker( retry( bulkhead( task ) ) )`.
//!
//! # Feature Tiers
//!
//! - default: the resilience primitives, configuration and observers
//! - `test-utils`: recording observer, flaky task fixtures and a tracing
//!   bootstrap for tests

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all, clippy::perf, clippy::complexity, clippy::suspicious)]

pub mod clock;
pub mod config;
pub mod error;
pub mod observability;
pub mod resilience;
pub mod utils;

// Testing utilities
// ---------------------------------------------------------------
#[cfg(any(feature = "test-utils", test))]
pub mod testing;

// Re-export commonly used types for convenience
// ------------------------
pub use clock::{Clock, MockClock, SystemClock};
pub use config::{ResilienceConfig, ResilienceConfigBuilder, ResilienceSettings};
pub use error::{
    BulkheadRejection, CircuitOpenError, ConfigError, ConfigResult, ResilienceError,
    ResilienceResult,
};
pub use observability::{
    MetricsCollector, MetricsObserver, NoOpMetricsCollector, NoOpObserver, ResilienceEvent,
    ResilienceObserver, SharedObserver, TracingObserver,
};
pub use resilience::{
    Bulkhead, BulkheadBuilder, BulkheadPermit, BulkheadStats, CircuitBreaker,
    CircuitBreakerBuilder, CircuitBreakerMetrics, CircuitState, OperationKey, ResiliencePipeline,
    ResilienceUnit, ResilientOperation, RetryOutcome, RetryPolicy,
};
pub use utils::serde::duration_millis;
