//! Rolling-window circuit breaker
//!
//! # States
//! - Closed: normal operation, outcomes are sampled into 1-second buckets
//! - Open: dependency assumed down, calls fail fast with `CircuitOpen`
//! - Half-Open: the sleep window has elapsed, a probe call tests recovery
//!
//! # State Transitions
//! ```text
//! Closed → Open:     samples in the 30s window > min_requests
//!                    AND failure rate > threshold
//! Open → Half-Open:  checked lazily on execute, now - last_trip > sleep_window
//! Half-Open → Closed: first recorded success (bucket history cleared)
//! Half-Open → Open:   first recorded failure (sleep window restarts)
//! ```
//!
//! # Probing
//! With `exclusive_probe` (the default) a single caller holds the probe token
//! while half-open; concurrent callers are rejected until its outcome is
//! recorded, and only the holder's outcome decides the transition. Late
//! outcomes from calls admitted before the trip are discarded. Without it
//! every caller arriving while half-open is let through and the first
//! recorded outcome decides the transition.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, instrument, trace};

use crate::clock::{Clock, SystemClock};
use crate::error::{CircuitOpenError, ConfigError, ConfigResult};
use crate::observability::{ResilienceEvent, SharedObserver, TracingObserver};
use crate::ResilienceConfig;

/// Span of time aggregated into one health bucket
pub const BUCKET_DURATION: Duration = Duration::from_secs(1);

/// Buckets older than this are evicted and no longer count toward the rate
pub const ROLLING_WINDOW: Duration = Duration::from_secs(30);

/// Circuit breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitState {
    /// Circuit is closed, allowing requests
    Closed,
    /// Circuit is open, rejecting requests
    Open,
    /// Circuit is half-open, admitting a probe to test recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Success/failure counters for one bucket of the rolling window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthBucket {
    pub successes: u64,
    pub failures: u64,
    pub started_at: Instant,
}

impl HealthBucket {
    const fn new(started_at: Instant) -> Self {
        Self { successes: 0, failures: 0, started_at }
    }
}

/// Point-in-time view of a breaker
#[derive(Debug, Clone, PartialEq)]
pub struct CircuitBreakerMetrics {
    pub state: CircuitState,
    /// Successes in buckets still inside the rolling window
    pub successes: u64,
    /// Failures in buckets still inside the rolling window
    pub failures: u64,
    pub bucket_count: usize,
    pub last_trip_time: Option<Instant>,
    /// Times the breaker has moved to Open (from Closed or Half-Open)
    pub trip_count: u64,
    /// Calls refused without invoking the task
    pub rejected_calls: u64,
}

impl CircuitBreakerMetrics {
    pub const fn total_requests(&self) -> u64 {
        self.successes + self.failures
    }

    /// Failure fraction over the window (0.0 when empty)
    pub fn failure_rate(&self) -> f64 {
        let total = self.total_requests();
        if total == 0 {
            return 0.0;
        }
        self.failures as f64 / total as f64
    }
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    buckets: VecDeque<HealthBucket>,
    last_trip_time: Option<Instant>,
    probe_in_flight: bool,
    /// Bumped on every trip and reset; a probe token is only valid for the
    /// epoch it was issued in
    epoch: u64,
    trip_count: u64,
    rejected_calls: u64,
}

impl BreakerState {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            buckets: VecDeque::new(),
            last_trip_time: None,
            probe_in_flight: false,
            epoch: 0,
            trip_count: 0,
            rejected_calls: 0,
        }
    }

    /// Current bucket, opening a fresh one (and evicting stale ones) when the
    /// newest bucket has expired
    fn active_bucket(&mut self, now: Instant) -> &mut HealthBucket {
        let expired = self
            .buckets
            .back()
            .map_or(true, |last| now.saturating_duration_since(last.started_at) >= BUCKET_DURATION);

        if expired {
            self.buckets.push_back(HealthBucket::new(now));
            while self
                .buckets
                .front()
                .is_some_and(|b| now.saturating_duration_since(b.started_at) >= ROLLING_WINDOW)
            {
                self.buckets.pop_front();
            }
        }

        // A bucket was pushed above if none existed
        let last = self.buckets.len() - 1;
        &mut self.buckets[last]
    }

    fn totals(&self) -> (u64, u64) {
        self.buckets.iter().fold((0, 0), |(s, f), b| (s + b.successes, f + b.failures))
    }

    fn trip(&mut self, now: Instant) {
        self.state = CircuitState::Open;
        self.last_trip_time = Some(now);
        self.probe_in_flight = false;
        self.epoch += 1;
        self.trip_count += 1;
    }
}

#[derive(Debug, Clone, Copy)]
enum Admission {
    Closed,
    /// Half-open without exclusive probing
    Probe,
    /// Holder of the exclusive probe token issued in `epoch`
    ProbeToken { epoch: u64 },
}

/// Circuit breaker over a rolling 30-second window of 1-second buckets
///
/// All bookkeeping lives behind one mutex that is never held across an
/// `.await`, so concurrent callers sharing the breaker observe consistent
/// state transitions.
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
///
/// use resilia::{CircuitBreaker, ResilienceError};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let breaker = CircuitBreaker::builder("inventory")
///     .threshold(0.5)
///     .min_requests(10)
///     .sleep_window(Duration::from_secs(2))
///     .build()?;
///
/// let value = breaker
///     .execute(|| async { Ok::<_, ResilienceError<std::io::Error>>(42) })
///     .await?;
/// assert_eq!(value, 42);
/// # Ok(())
/// # }
/// ```
pub struct CircuitBreaker<C: Clock = SystemClock> {
    name: String,
    threshold: f64,
    min_requests: u64,
    sleep_window: Duration,
    exclusive_probe: bool,
    inner: Mutex<BreakerState>,
    clock: C,
    observer: SharedObserver,
}

impl<C: Clock> fmt::Debug for CircuitBreaker<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .field("threshold", &self.threshold)
            .field("min_requests", &self.min_requests)
            .field("sleep_window", &self.sleep_window)
            .finish_non_exhaustive()
    }
}

impl CircuitBreaker<SystemClock> {
    /// Start building a breaker that uses the system clock
    pub fn builder(name: impl Into<String>) -> CircuitBreakerBuilder<SystemClock> {
        CircuitBreakerBuilder::new(name, SystemClock)
    }
}

impl<C: Clock> CircuitBreaker<C> {
    /// Build a breaker from the breaker fields of a resilience config
    pub fn from_config(
        name: impl Into<String>,
        config: &ResilienceConfig,
        clock: C,
        observer: SharedObserver,
    ) -> ConfigResult<Self> {
        CircuitBreakerBuilder::new(name, clock)
            .threshold(config.error_threshold)
            .min_requests(config.min_requests)
            .sleep_window(config.sleep_window)
            .exclusive_probe(config.exclusive_probe)
            .observer(observer)
            .build()
    }

    /// Execute an operation with circuit breaker protection
    ///
    /// Rejects with [`CircuitOpenError`] (converted into `E`) without calling
    /// `operation` while open. Otherwise runs it, records the outcome and
    /// hands back the operation's own result untouched.
    #[instrument(skip(self, operation), fields(breaker = %self.name, state = %self.state()))]
    pub async fn execute<F, Fut, T, E>(&self, operation: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        let admission = self.admit()?;

        let mut token = ProbeToken {
            breaker: self,
            epoch: match admission {
                Admission::ProbeToken { epoch } => Some(epoch),
                _ => None,
            },
        };
        let result = operation().await;
        token.epoch = None;

        self.record_admitted(result.is_ok(), admission);
        result
    }

    /// Lazy Open → Half-Open check followed by the admission decision
    fn admit(&self) -> Result<Admission, CircuitOpenError> {
        let now = self.clock.now();
        let mut transition = None;

        let decision = {
            let mut inner = self.inner.lock();

            if inner.state == CircuitState::Open
                && inner
                    .last_trip_time
                    .map_or(true, |t| now.saturating_duration_since(t) > self.sleep_window)
            {
                inner.state = CircuitState::HalfOpen;
                inner.probe_in_flight = false;
                transition = Some((CircuitState::Open, CircuitState::HalfOpen));
            }

            match inner.state {
                CircuitState::Closed => Ok(Admission::Closed),
                CircuitState::Open => {
                    inner.rejected_calls += 1;
                    Err(CircuitOpenError)
                }
                CircuitState::HalfOpen if !self.exclusive_probe => Ok(Admission::Probe),
                CircuitState::HalfOpen if inner.probe_in_flight => {
                    inner.rejected_calls += 1;
                    Err(CircuitOpenError)
                }
                CircuitState::HalfOpen => {
                    inner.probe_in_flight = true;
                    Ok(Admission::ProbeToken { epoch: inner.epoch })
                }
            }
        };

        if let Some((from, to)) = transition {
            debug!(breaker = %self.name, "Sleep window elapsed, admitting a probe");
            self.emit_state_change(from, to);
        }
        if decision.is_err() {
            debug!(breaker = %self.name, "Circuit breaker rejecting call");
        }
        decision
    }

    /// Record the outcome of a call made outside [`CircuitBreaker::execute`]
    ///
    /// While closed the outcome lands in the current bucket and the trip
    /// condition is re-evaluated. Outcomes arriving while open are ignored.
    /// While half-open the outcome decides the transition, unless probing is
    /// exclusive: then only the token holder's outcome counts and this one is
    /// discarded.
    pub fn record(&self, success: bool) {
        self.record_admitted(success, Admission::Closed);
    }

    fn record_admitted(&self, success: bool, admission: Admission) {
        let now = self.clock.now();

        let transition = {
            let mut inner = self.inner.lock();
            let decides_probe = !self.exclusive_probe
                || matches!(admission, Admission::ProbeToken { epoch } if epoch == inner.epoch);

            match inner.state {
                CircuitState::HalfOpen if !decides_probe => {
                    trace!(breaker = %self.name, success, "Stale outcome ignored while probing");
                    None
                }
                CircuitState::HalfOpen => {
                    inner.probe_in_flight = false;
                    if success {
                        inner.state = CircuitState::Closed;
                        inner.buckets.clear();
                    } else {
                        inner.trip(now);
                    }
                    Some((CircuitState::HalfOpen, inner.state))
                }
                CircuitState::Closed => {
                    let bucket = inner.active_bucket(now);
                    if success {
                        bucket.successes += 1;
                    } else {
                        bucket.failures += 1;
                    }

                    let (successes, failures) = inner.totals();
                    let total = successes + failures;
                    if total > self.min_requests
                        && failures as f64 / total as f64 > self.threshold
                    {
                        inner.trip(now);
                        Some((CircuitState::Closed, CircuitState::Open))
                    } else {
                        None
                    }
                }
                CircuitState::Open => {
                    trace!(breaker = %self.name, success, "Outcome ignored while circuit is open");
                    None
                }
            }
        };

        let Some((from, to)) = transition else {
            return;
        };
        match (from, to) {
            (CircuitState::HalfOpen, CircuitState::Closed) => {
                debug!(breaker = %self.name, "Probe succeeded, closing circuit");
            }
            (CircuitState::HalfOpen, _) => {
                debug!(breaker = %self.name, "Probe failed, reopening circuit");
            }
            _ => {
                debug!(breaker = %self.name, "Failure rate above threshold, tripping circuit");
            }
        }
        self.emit_state_change(from, to);
    }

    fn emit_state_change(&self, from: CircuitState, to: CircuitState) {
        self.observer.on_event(
            &self.name,
            &ResilienceEvent::StateChanged { from, to, timestamp: self.clock.system_time() },
        );
    }

    fn release_probe(&self, epoch: u64) {
        let mut inner = self.inner.lock();
        if inner.state == CircuitState::HalfOpen && inner.epoch == epoch {
            inner.probe_in_flight = false;
        }
    }

    /// True while the circuit is open
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Current state (no lazy transition is applied)
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Snapshot of the rolling window and trip history
    pub fn metrics(&self) -> CircuitBreakerMetrics {
        let now = self.clock.now();
        let inner = self.inner.lock();
        let live = inner
            .buckets
            .iter()
            .filter(|b| now.saturating_duration_since(b.started_at) < ROLLING_WINDOW);

        let (mut successes, mut failures, mut bucket_count) = (0, 0, 0);
        for bucket in live {
            successes += bucket.successes;
            failures += bucket.failures;
            bucket_count += 1;
        }

        CircuitBreakerMetrics {
            state: inner.state,
            successes,
            failures,
            bucket_count,
            last_trip_time: inner.last_trip_time,
            trip_count: inner.trip_count,
            rejected_calls: inner.rejected_calls,
        }
    }

    /// Force the breaker back to closed with an empty window
    pub fn reset(&self) {
        let previous = {
            let mut inner = self.inner.lock();
            let previous = inner.state;
            inner.state = CircuitState::Closed;
            inner.buckets.clear();
            inner.probe_in_flight = false;
            inner.epoch += 1;
            previous
        };
        info!(breaker = %self.name, "Circuit breaker manually reset to closed state");
        if previous != CircuitState::Closed {
            self.emit_state_change(previous, CircuitState::Closed);
        }
    }
}

/// Returns the half-open probe token if the probing future is dropped before
/// its outcome is recorded
struct ProbeToken<'a, C: Clock> {
    breaker: &'a CircuitBreaker<C>,
    epoch: Option<u64>,
}

impl<C: Clock> Drop for ProbeToken<'_, C> {
    fn drop(&mut self) {
        if let Some(epoch) = self.epoch {
            debug!(breaker = %self.breaker.name, "Probe abandoned, releasing token");
            self.breaker.release_probe(epoch);
        }
    }
}

/// Builder for [`CircuitBreaker`]
pub struct CircuitBreakerBuilder<C: Clock> {
    name: String,
    threshold: f64,
    min_requests: u64,
    sleep_window: Duration,
    exclusive_probe: bool,
    clock: C,
    observer: SharedObserver,
}

impl<C: Clock> CircuitBreakerBuilder<C> {
    pub fn new(name: impl Into<String>, clock: C) -> Self {
        Self {
            name: name.into(),
            threshold: 0.5,
            min_requests: 10,
            sleep_window: Duration::from_secs(30),
            exclusive_probe: true,
            clock,
            observer: Arc::new(TracingObserver),
        }
    }

    pub const fn threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub const fn min_requests(mut self, min: u64) -> Self {
        self.min_requests = min;
        self
    }

    pub const fn sleep_window(mut self, window: Duration) -> Self {
        self.sleep_window = window;
        self
    }

    pub const fn exclusive_probe(mut self, exclusive: bool) -> Self {
        self.exclusive_probe = exclusive;
        self
    }

    pub fn observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    /// Swap the clock (useful for testing)
    pub fn clock<C2: Clock>(self, clock: C2) -> CircuitBreakerBuilder<C2> {
        CircuitBreakerBuilder {
            name: self.name,
            threshold: self.threshold,
            min_requests: self.min_requests,
            sleep_window: self.sleep_window,
            exclusive_probe: self.exclusive_probe,
            clock,
            observer: self.observer,
        }
    }

    pub fn build(self) -> ConfigResult<CircuitBreaker<C>> {
        if !(self.threshold > 0.0 && self.threshold <= 1.0) {
            return Err(ConfigError::invalid(format!(
                "threshold must be in (0, 1], got {}",
                self.threshold
            )));
        }
        if self.sleep_window.is_zero() {
            return Err(ConfigError::invalid("sleep_window must be greater than 0"));
        }

        Ok(CircuitBreaker {
            name: self.name,
            threshold: self.threshold,
            min_requests: self.min_requests,
            sleep_window: self.sleep_window,
            exclusive_probe: self.exclusive_probe,
            inner: Mutex::new(BreakerState::new()),
            clock: self.clock,
            observer: self.observer,
        })
    }
}
