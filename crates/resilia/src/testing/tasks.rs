//! Task fixtures for exercising the resilience layers

use std::future::Future;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Error produced by a [`FlakyTask`] attempt
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("flaky failure on attempt {attempt}")]
pub struct FlakyError {
    /// 1-based invocation number that failed
    pub attempt: u32,
}

/// Task that fails a fixed number of times before succeeding
///
/// Clones share the invocation counter.
#[derive(Debug, Clone)]
pub struct FlakyTask {
    failures: u32,
    latency: Duration,
    calls: Arc<AtomicU32>,
}

impl FlakyTask {
    /// Fail the first `failures` invocations, then succeed
    pub fn new(failures: u32) -> Self {
        Self { failures, latency: Duration::ZERO, calls: Arc::new(AtomicU32::new(0)) }
    }

    pub fn always_failing() -> Self {
        Self::new(u32::MAX)
    }

    pub fn always_succeeding() -> Self {
        Self::new(0)
    }

    /// Sleep for `latency` inside every invocation
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Invoke once; the invocation is counted immediately
    pub fn call(&self) -> impl Future<Output = Result<&'static str, FlakyError>> + Send + 'static {
        let attempt = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        let failures = self.failures;
        let latency = self.latency;
        async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            if attempt <= failures {
                Err(FlakyError { attempt })
            } else {
                Ok("Data Success")
            }
        }
    }

    /// Invocations so far
    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Tracks how many holders are inside a section at once, and the peak
#[derive(Debug, Default)]
pub struct ConcurrencyGauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

impl ConcurrencyGauge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enter the section until the guard is dropped
    pub fn enter(&self) -> GaugeGuard<'_> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        GaugeGuard { gauge: self }
    }

    pub fn current(&self) -> usize {
        self.current.load(Ordering::SeqCst)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

/// Leaves the [`ConcurrencyGauge`] section on drop
#[derive(Debug)]
pub struct GaugeGuard<'a> {
    gauge: &'a ConcurrencyGauge,
}

impl Drop for GaugeGuard<'_> {
    fn drop(&mut self) {
        self.gauge.current.fetch_sub(1, Ordering::SeqCst);
    }
}
