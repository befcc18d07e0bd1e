//! Testing utilities and helpers
//!
//! Available under `cfg(test)` and the `test-utils` feature:
//! - **[`observer`]**: an in-memory [`RecordingObserver`]
//! - **[`tasks`]**: fault-injecting task fixtures and a concurrency gauge
//! - **[`async_utils`]**: `assert_eventually_async!` and timeout helpers
//! - **[`init_test_tracing`]**: idempotent `tracing` bootstrap for tests
//!
//! ## Usage
//!
//! ```rust
//! # #[cfg(feature = "test-utils")]
//! # async fn example() {
//! use resilia::testing::FlakyTask;
//! use resilia::RetryPolicy;
//!
//! let task = FlakyTask::new(2);
//! let result = RetryPolicy::default().run(|| task.call()).await;
//! assert!(result.is_ok());
//! assert_eq!(task.calls(), 3);
//! # }
//! ```

// Test helpers favour brevity over exhaustive error/panic docs
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod async_utils;
pub mod observer;
pub mod tasks;

pub use async_utils::timeout_ok;
pub use observer::RecordingObserver;
pub use tasks::{ConcurrencyGauge, FlakyError, FlakyTask, GaugeGuard};

use tracing_subscriber::EnvFilter;

/// Install a test-friendly `tracing` subscriber
///
/// Honours `RUST_LOG` and falls back to `warn`. Safe to call from every test;
/// only the first call installs anything.
pub fn init_test_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().try_init();
}
