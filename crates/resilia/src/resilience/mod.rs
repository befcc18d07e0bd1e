//! Resilience primitives and their composition
//!
//! - **Circuit Breaker**: fails fast while a dependency's recent failure rate
//!   is above threshold, probing for recovery after a sleep window
//! - **Bulkhead**: bounds concurrency with a timed FIFO wait queue
//! - **Retry**: capped exponential backoff with full jitter
//! - **Pipeline**: keyed registry nesting the three as
//!   `breaker( retry( bulkhead( task ) ) )`
//!
//! The primitives are usable on their own; the pipeline is what guarantees
//! one shared breaker/bulkhead pair per protected operation.

pub mod bulkhead;
pub mod circuit_breaker;
pub mod pipeline;
pub mod retry;

pub use bulkhead::{Bulkhead, BulkheadBuilder, BulkheadPermit, BulkheadStats};
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerBuilder, CircuitBreakerMetrics, CircuitState, HealthBucket,
    BUCKET_DURATION, ROLLING_WINDOW,
};
pub use pipeline::{OperationKey, ResiliencePipeline, ResilienceUnit, ResilientOperation};
pub use retry::{RetryOutcome, RetryPolicy};
