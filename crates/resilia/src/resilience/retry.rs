//! Retry with capped, full-jitter exponential backoff
//!
//! A task is attempted up to `max_retries + 1` times. After the failure of
//! attempt `n` (0-based) the policy sleeps for a delay drawn uniformly from
//! `[0, min(cap_delay, base_delay * 2^n)]` before trying again. No sleep
//! follows the final attempt.
//!
//! Errors are not classified: any failure is retried while attempts remain.
//! When every attempt fails the *last* error is returned unchanged, so the
//! caller keeps the diagnostic detail of the most recent failure.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument, warn};

/// Immutable per-call retry parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
    cap_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_millis(100), Duration::from_secs(10))
    }
}

impl RetryPolicy {
    pub const fn new(max_retries: u32, base_delay: Duration, cap_delay: Duration) -> Self {
        Self { max_retries, base_delay, cap_delay }
    }

    /// A policy that makes exactly one attempt
    pub const fn no_retry() -> Self {
        Self::new(0, Duration::ZERO, Duration::ZERO)
    }

    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub const fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub const fn cap_delay(&self) -> Duration {
        self.cap_delay
    }

    /// Total attempts this policy allows
    pub const fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Upper bound of the jittered delay after failed attempt `attempt`
    pub fn max_delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .map_or(self.cap_delay, |delay| delay.min(self.cap_delay))
    }

    /// Draw a full-jitter delay for failed attempt `attempt`
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let max_ms = u64::try_from(self.max_delay_for(attempt).as_millis()).unwrap_or(u64::MAX);
        if max_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=max_ms))
    }

    /// Run `operation` under this policy, returning its value or last error
    #[instrument(skip(self, operation), fields(max_retries = self.max_retries))]
    pub async fn run<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        self.run_with_outcome(operation).await.into_result()
    }

    /// Run `operation` and report how many attempts and which delays it took
    pub async fn run_with_outcome<F, Fut, T, E>(&self, mut operation: F) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let mut attempt: u32 = 0;
        let mut delays = Vec::new();

        loop {
            match operation().await {
                Ok(value) => {
                    if attempt > 0 {
                        debug!(retries = attempt, "Operation succeeded after retries");
                    }
                    return RetryOutcome { result: Ok(value), attempts: attempt + 1, delays };
                }
                Err(error) => {
                    if attempt >= self.max_retries {
                        warn!(
                            attempts = attempt + 1,
                            error = %error,
                            "All retry attempts exhausted, returning last error"
                        );
                        return RetryOutcome { result: Err(error), attempts: attempt + 1, delays };
                    }

                    let delay = self.backoff_delay(attempt);
                    warn!(
                        attempt = attempt + 1,
                        delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                        error = %error,
                        "Attempt failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    delays.push(delay);
                    attempt += 1;
                }
            }
        }
    }
}

/// Result of a retried run plus the attempt history
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    /// Attempts made, including the first
    pub attempts: u32,
    /// Backoff delays slept, one per retry
    pub delays: Vec<Duration>,
}

impl<T, E> RetryOutcome<T, E> {
    pub fn into_result(self) -> Result<T, E> {
        self.result
    }

    pub const fn is_success(&self) -> bool {
        self.result.is_ok()
    }

    /// Sum of all backoff delays
    pub fn total_delay(&self) -> Duration {
        self.delays.iter().sum()
    }
}
