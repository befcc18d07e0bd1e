//! Error types for resilience operations
//!
//! | Variant | Raised by | Retried? |
//! |---------|-----------|----------|
//! | `CircuitOpen` | circuit breaker | never; the breaker wraps the retry loop |
//! | `CapacityExceeded` | bulkhead, queue full | yes, consumes an attempt |
//! | `QueueTimeout` | bulkhead, wait timed out | yes, consumes an attempt |
//! | `Operation` | the wrapped task | yes; the last error survives exhaustion |
//! | `InvalidConfig` | pipeline, building a unit | never |

use std::time::Duration;

use thiserror::Error;

/// Errors surfaced by the resilience layers
///
/// Generic over the wrapped operation's error type `E` so the caller always
/// gets its own error back when the task itself failed.
#[derive(Debug, Error)]
pub enum ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Circuit breaker is open, rejecting calls
    #[error("Circuit is OPEN: request rejected to protect the system")]
    CircuitOpen,

    /// Bulkhead queue was full at admission time
    #[error("Bulkhead capacity exceeded: queue limit {queue_limit} reached")]
    CapacityExceeded { queue_limit: usize },

    /// Waited in the bulkhead queue longer than the wait timeout
    #[error("Bulkhead timeout after waiting {timeout:?} for a slot")]
    QueueTimeout { timeout: Duration },

    /// The underlying operation failed
    #[error("Operation failed: {source}")]
    Operation {
        #[source]
        source: E,
    },

    /// The breaker/bulkhead pair could not be built from the given config
    #[error("Invalid resilience configuration: {0}")]
    InvalidConfig(#[source] ConfigError),
}

impl<E> ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    /// Wrap an operation error
    pub const fn operation(source: E) -> Self {
        Self::Operation { source }
    }

    /// True when a resilience layer refused the call before the task ran
    pub const fn is_rejection(&self) -> bool {
        !matches!(self, Self::Operation { .. })
    }

    /// True when the retry layer may re-attempt after this error
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::CircuitOpen | Self::InvalidConfig(_))
    }

    /// Borrow the operation error, if the task itself failed
    pub const fn operation_error(&self) -> Option<&E> {
        match self {
            Self::Operation { source } => Some(source),
            _ => None,
        }
    }

    /// Consume and return the operation error, if the task itself failed
    pub fn into_operation_error(self) -> Option<E> {
        match self {
            Self::Operation { source } => Some(source),
            _ => None,
        }
    }

    /// Map the operation error, leaving rejections untouched
    pub fn map_operation<F, E2>(self, f: F) -> ResilienceError<E2>
    where
        F: FnOnce(E) -> E2,
        E2: std::error::Error + Send + Sync + 'static,
    {
        match self {
            Self::CircuitOpen => ResilienceError::CircuitOpen,
            Self::CapacityExceeded { queue_limit } => {
                ResilienceError::CapacityExceeded { queue_limit }
            }
            Self::QueueTimeout { timeout } => ResilienceError::QueueTimeout { timeout },
            Self::InvalidConfig(error) => ResilienceError::InvalidConfig(error),
            Self::Operation { source } => ResilienceError::Operation { source: f(source) },
        }
    }
}

/// Rejection raised by a breaker that is open (or busy probing)
///
/// [`crate::CircuitBreaker::execute`] is generic over any error that can be
/// built from this, so the breaker can wrap tasks that already speak
/// [`ResilienceError`] without nesting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("Circuit is OPEN: request rejected to protect the system")]
pub struct CircuitOpenError;

impl<E> From<CircuitOpenError> for ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(_: CircuitOpenError) -> Self {
        Self::CircuitOpen
    }
}

/// Rejection raised by a bulkhead that could not grant a slot
///
/// Returned by [`crate::Bulkhead::acquire`], which never runs a task and so
/// has no operation error to carry. Converts into the matching
/// [`ResilienceError`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BulkheadRejection {
    #[error("Bulkhead capacity exceeded: queue limit {queue_limit} reached")]
    CapacityExceeded { queue_limit: usize },

    #[error("Bulkhead timeout after waiting {timeout:?} for a slot")]
    QueueTimeout { timeout: Duration },
}

impl<E> From<BulkheadRejection> for ResilienceError<E>
where
    E: std::error::Error + Send + Sync + 'static,
{
    fn from(rejection: BulkheadRejection) -> Self {
        match rejection {
            BulkheadRejection::CapacityExceeded { queue_limit } => {
                Self::CapacityExceeded { queue_limit }
            }
            BulkheadRejection::QueueTimeout { timeout } => Self::QueueTimeout { timeout },
        }
    }
}

/// Result type for resilience operations
pub type ResilienceResult<T, E> = Result<T, ResilienceError<E>>;

/// Configuration loading and validation errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse {format} config: {message}")]
    Parse { format: &'static str, message: String },

    #[error("Invalid value for environment variable {name}: {value}")]
    InvalidEnv { name: String, value: String },

    #[error("Unsupported config file extension: {0}")]
    UnsupportedFormat(String),
}

impl ConfigError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid { message: message.into() }
    }
}

/// Configuration result type
pub type ConfigResult<T> = Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("db down")]
    struct DbError;

    #[test]
    fn test_rejections_are_classified() {
        let open: ResilienceError<DbError> = ResilienceError::CircuitOpen;
        let full: ResilienceError<DbError> = ResilienceError::CapacityExceeded { queue_limit: 2 };
        let timeout: ResilienceError<DbError> =
            ResilienceError::QueueTimeout { timeout: Duration::from_millis(100) };
        let failed = ResilienceError::operation(DbError);

        assert!(open.is_rejection() && !open.is_retryable());
        assert!(full.is_rejection() && full.is_retryable());
        assert!(timeout.is_rejection() && timeout.is_retryable());
        assert!(!failed.is_rejection() && failed.is_retryable());
    }

    #[test]
    fn test_operation_error_preserved() {
        let err = ResilienceError::operation(DbError);
        assert_eq!(err.to_string(), "Operation failed: db down");
        assert!(err.operation_error().is_some());
        assert!(err.into_operation_error().is_some());
    }

    #[test]
    fn test_circuit_open_converts() {
        let err: ResilienceError<DbError> = CircuitOpenError.into();
        assert!(matches!(err, ResilienceError::CircuitOpen));
        assert!(err.to_string().contains("OPEN"));
    }

    #[test]
    fn test_bulkhead_rejection_converts() {
        let full: ResilienceError<DbError> =
            BulkheadRejection::CapacityExceeded { queue_limit: 3 }.into();
        assert!(matches!(full, ResilienceError::CapacityExceeded { queue_limit: 3 }));

        let rejection = BulkheadRejection::QueueTimeout { timeout: Duration::from_millis(100) };
        let timeout: ResilienceError<DbError> = rejection.into();
        assert_eq!(timeout.to_string(), rejection.to_string());
        assert!(timeout.is_retryable());
    }

    #[test]
    fn test_map_operation_keeps_rejections() {
        let err: ResilienceError<DbError> = ResilienceError::CapacityExceeded { queue_limit: 4 };
        let mapped = err.map_operation(|_| std::io::Error::other("unreachable"));
        assert!(matches!(mapped, ResilienceError::CapacityExceeded { queue_limit: 4 }));

        let err = ResilienceError::operation(DbError);
        let mapped = err.map_operation(|e| std::io::Error::other(e.to_string()));
        assert_eq!(mapped.operation_error().map(ToString::to_string).as_deref(), Some("db down"));
    }
}
