//! Bulkhead with a bounded FIFO wait queue
//!
//! At most `concurrency_limit` tasks run at once. Callers arriving while every
//! slot is busy join a queue of at most `queue_limit` waiters; beyond that they
//! are rejected straight away with `CapacityExceeded`. A queued caller gives up
//! with `QueueTimeout` once `wait_timeout` elapses.
//!
//! A finishing task hands its slot directly to the oldest live waiter, so a
//! caller that arrives during the hand-off can never overtake the queue.

use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, instrument, trace};

use crate::error::{BulkheadRejection, ConfigError, ConfigResult, ResilienceError, ResilienceResult};
use crate::observability::{ResilienceEvent, SharedObserver, TracingObserver};
use crate::ResilienceConfig;

/// Snapshot of a bulkhead's occupancy and totals
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BulkheadStats {
    pub active_count: usize,
    pub queue_length: usize,
    pub concurrency_limit: usize,
    pub queue_limit: usize,
    /// Calls admitted to run, immediately or after queueing
    pub total_accepted: u64,
    /// Calls refused because the queue was full or the wait timed out
    pub total_rejected: u64,
}

impl BulkheadStats {
    /// Fraction of run slots in use (0.0 to 1.0)
    pub fn utilization(&self) -> f64 {
        if self.concurrency_limit == 0 {
            return 0.0;
        }
        self.active_count as f64 / self.concurrency_limit as f64
    }

    /// Calculate the rejection rate as a percentage (0.0 to 1.0)
    pub fn rejection_rate(&self) -> f64 {
        let total = self.total_accepted + self.total_rejected;
        if total == 0 {
            return 0.0;
        }
        self.total_rejected as f64 / total as f64
    }

    /// Check if the bulkhead is at capacity
    pub const fn is_at_capacity(&self) -> bool {
        self.active_count >= self.concurrency_limit
    }

    /// Get a human-readable status message
    pub fn status_message(&self) -> String {
        format!(
            "Bulkhead: {}/{} active ({:.1}% utilized), {}/{} queued, {} accepted, {} rejected",
            self.active_count,
            self.concurrency_limit,
            self.utilization() * 100.0,
            self.queue_length,
            self.queue_limit,
            self.total_accepted,
            self.total_rejected
        )
    }
}

struct Waiter {
    id: u64,
    grant: oneshot::Sender<()>,
}

struct BulkheadState {
    active: usize,
    queue: VecDeque<Waiter>,
    next_waiter_id: u64,
    total_accepted: u64,
    total_rejected: u64,
}

impl BulkheadState {
    /// Drop the waiter from the queue, returning whether it was still queued
    fn remove_waiter(&mut self, id: u64) -> bool {
        match self.queue.iter().position(|w| w.id == id) {
            Some(index) => {
                self.queue.remove(index);
                true
            }
            None => false,
        }
    }

    /// Give up one slot, passing it to the oldest waiter that is still listening
    ///
    /// Returns the active count after the release and before any hand-off.
    fn release_slot(&mut self) -> usize {
        self.active = self.active.saturating_sub(1);
        let released = self.active;
        while let Some(waiter) = self.queue.pop_front() {
            self.active += 1;
            if waiter.grant.send(()).is_ok() {
                self.total_accepted += 1;
                break;
            }
            self.active -= 1;
        }
        released
    }
}

enum Admission {
    Admitted { active_count: usize },
    Queued { id: u64, grant: oneshot::Receiver<()>, queue_length: usize },
    Rejected { total_rejected: u64 },
}

/// Concurrency limiter with a bounded, timed FIFO queue
///
/// # Examples
///
/// ```rust
/// use std::time::Duration;
///
/// use resilia::Bulkhead;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let bulkhead = Bulkhead::builder("reports")
///     .concurrency_limit(2)
///     .queue_limit(10)
///     .wait_timeout(Duration::from_millis(500))
///     .build()?;
///
/// let rows = bulkhead.run(|| async { Ok::<_, std::io::Error>(vec![1, 2, 3]) }).await?;
/// assert_eq!(rows.len(), 3);
/// # Ok(())
/// # }
/// ```
pub struct Bulkhead {
    name: String,
    concurrency_limit: usize,
    queue_limit: usize,
    wait_timeout: Duration,
    state: Mutex<BulkheadState>,
    observer: SharedObserver,
}

impl fmt::Debug for Bulkhead {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Bulkhead")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .field("wait_timeout", &self.wait_timeout)
            .finish_non_exhaustive()
    }
}

impl Bulkhead {
    pub fn builder(name: impl Into<String>) -> BulkheadBuilder {
        BulkheadBuilder::new(name)
    }

    /// Build a bulkhead from the bulkhead fields of a resilience config
    pub fn from_config(
        name: impl Into<String>,
        config: &ResilienceConfig,
        observer: SharedObserver,
    ) -> ConfigResult<Self> {
        BulkheadBuilder::new(name)
            .concurrency_limit(config.concurrency_limit)
            .queue_limit(config.queue_limit)
            .wait_timeout(config.wait_timeout)
            .observer(observer)
            .build()
    }

    /// Run `task` once a slot is free, waiting at most the configured timeout
    pub async fn run<F, Fut, T, E>(&self, task: F) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        self.run_with_timeout(task, self.wait_timeout).await
    }

    /// Run `task` once a slot is free, waiting at most `wait_timeout`
    pub async fn run_with_timeout<F, Fut, T, E>(
        &self,
        task: F,
        wait_timeout: Duration,
    ) -> ResilienceResult<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let _permit = self.acquire_with_timeout(wait_timeout).await?;
        task().await.map_err(ResilienceError::operation)
    }

    /// Wait for a slot using the configured timeout
    pub async fn acquire(&self) -> Result<BulkheadPermit<'_>, BulkheadRejection> {
        self.acquire_with_timeout(self.wait_timeout).await
    }

    /// Wait for a slot; the slot is held until the returned permit is dropped
    #[instrument(skip(self), fields(bulkhead = %self.name))]
    pub async fn acquire_with_timeout(
        &self,
        wait_timeout: Duration,
    ) -> Result<BulkheadPermit<'_>, BulkheadRejection> {
        let admission = {
            let mut state = self.state.lock();
            if state.active < self.concurrency_limit {
                state.active += 1;
                state.total_accepted += 1;
                Admission::Admitted { active_count: state.active }
            } else if state.queue.len() >= self.queue_limit {
                state.total_rejected += 1;
                Admission::Rejected { total_rejected: state.total_rejected }
            } else {
                let (tx, rx) = oneshot::channel();
                let id = state.next_waiter_id;
                state.next_waiter_id += 1;
                state.queue.push_back(Waiter { id, grant: tx });
                Admission::Queued { id, grant: rx, queue_length: state.queue.len() }
            }
        };

        match admission {
            Admission::Admitted { active_count } => {
                self.emit(ResilienceEvent::Accepted { active_count });
                Ok(BulkheadPermit { bulkhead: self })
            }
            Admission::Rejected { total_rejected } => {
                debug!(queue_limit = self.queue_limit, "Bulkhead queue full, rejecting");
                self.emit(ResilienceEvent::Rejected { total_rejected });
                Err(BulkheadRejection::CapacityExceeded { queue_limit: self.queue_limit })
            }
            Admission::Queued { id, grant, queue_length } => {
                self.emit(ResilienceEvent::Queued { queue_length });
                self.wait_for_slot(id, grant, wait_timeout).await
            }
        }
    }

    async fn wait_for_slot(
        &self,
        id: u64,
        grant: oneshot::Receiver<()>,
        wait_timeout: Duration,
    ) -> Result<BulkheadPermit<'_>, BulkheadRejection> {
        let mut waiting = QueuedWaiter { bulkhead: self, id, grant, settled: false };
        let granted = matches!(
            tokio::time::timeout(wait_timeout, &mut waiting.grant).await,
            Ok(Ok(()))
        );

        let outcome = {
            let mut state = self.state.lock();
            waiting.settled = true;
            if granted {
                Ok(state.active)
            } else if state.remove_waiter(id) {
                state.total_rejected += 1;
                Err(state.total_rejected)
            } else {
                // The slot was handed over as the timer fired
                match waiting.grant.try_recv() {
                    Ok(()) => Ok(state.active),
                    Err(_) => {
                        state.total_rejected += 1;
                        Err(state.total_rejected)
                    }
                }
            }
        };

        match outcome {
            Ok(active_count) => {
                trace!(waiter = id, "Bulkhead slot granted to queued caller");
                self.emit(ResilienceEvent::Accepted { active_count });
                Ok(BulkheadPermit { bulkhead: self })
            }
            Err(total_rejected) => {
                debug!(timeout = ?wait_timeout, "Timed out waiting for a bulkhead slot");
                self.emit(ResilienceEvent::TimedOut { total_rejected });
                Err(BulkheadRejection::QueueTimeout { timeout: wait_timeout })
            }
        }
    }

    fn release(&self) {
        let active_count = self.state.lock().release_slot();
        self.emit(ResilienceEvent::Completed { active_count });
    }

    fn emit(&self, event: ResilienceEvent) {
        self.observer.on_event(&self.name, &event);
    }

    /// Current occupancy and totals
    pub fn stats(&self) -> BulkheadStats {
        let state = self.state.lock();
        BulkheadStats {
            active_count: state.active,
            queue_length: state.queue.len(),
            concurrency_limit: self.concurrency_limit,
            queue_limit: self.queue_limit,
            total_accepted: state.total_accepted,
            total_rejected: state.total_rejected,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub const fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }
}

/// A held bulkhead slot, released (and handed on) when dropped
#[must_use = "the slot is released as soon as the permit is dropped"]
pub struct BulkheadPermit<'a> {
    bulkhead: &'a Bulkhead,
}

impl fmt::Debug for BulkheadPermit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkheadPermit").field("bulkhead", &self.bulkhead.name).finish()
    }
}

impl Drop for BulkheadPermit<'_> {
    fn drop(&mut self) {
        self.bulkhead.release();
    }
}

/// A caller parked in the queue
///
/// If the waiting future is dropped before settling, the waiter leaves the
/// queue, or passes on a slot that was already handed to it.
struct QueuedWaiter<'a> {
    bulkhead: &'a Bulkhead,
    id: u64,
    grant: oneshot::Receiver<()>,
    settled: bool,
}

impl Drop for QueuedWaiter<'_> {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let passed_on = {
            let mut state = self.bulkhead.state.lock();
            if state.remove_waiter(self.id) {
                false
            } else {
                state.release_slot();
                true
            }
        };
        trace!(waiter = self.id, passed_on, "Queued caller abandoned its wait");
    }
}

/// Builder for [`Bulkhead`]
pub struct BulkheadBuilder {
    name: String,
    concurrency_limit: usize,
    queue_limit: usize,
    wait_timeout: Duration,
    observer: SharedObserver,
}

impl BulkheadBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            concurrency_limit: 10,
            queue_limit: 1000,
            wait_timeout: Duration::from_secs(5),
            observer: Arc::new(TracingObserver),
        }
    }

    pub const fn concurrency_limit(mut self, limit: usize) -> Self {
        self.concurrency_limit = limit;
        self
    }

    pub const fn queue_limit(mut self, limit: usize) -> Self {
        self.queue_limit = limit;
        self
    }

    pub const fn wait_timeout(mut self, timeout: Duration) -> Self {
        self.wait_timeout = timeout;
        self
    }

    pub fn observer(mut self, observer: SharedObserver) -> Self {
        self.observer = observer;
        self
    }

    pub fn build(self) -> ConfigResult<Bulkhead> {
        if self.concurrency_limit == 0 {
            return Err(ConfigError::invalid("concurrency_limit must be greater than 0"));
        }

        Ok(Bulkhead {
            name: self.name,
            concurrency_limit: self.concurrency_limit,
            queue_limit: self.queue_limit,
            wait_timeout: self.wait_timeout,
            state: Mutex::new(BulkheadState {
                active: 0,
                queue: VecDeque::new(),
                next_waiter_id: 0,
                total_accepted: 0,
                total_rejected: 0,
            }),
            observer: self.observer,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io;
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::testing::RecordingObserver;

    fn bulkhead(limit: usize, queue: usize, wait_ms: u64) -> Arc<Bulkhead> {
        Arc::new(
            Bulkhead::builder("ReportService::generate")
                .concurrency_limit(limit)
                .queue_limit(queue)
                .wait_timeout(Duration::from_millis(wait_ms))
                .build()
                .expect("valid bulkhead"),
        )
    }

    async fn wait_for_queue(bulkhead: &Bulkhead, len: usize) {
        while bulkhead.stats().queue_length < len {
            tokio::task::yield_now().await;
        }
    }

    #[test]
    fn test_zero_concurrency_is_invalid() {
        assert!(Bulkhead::builder("x").concurrency_limit(0).build().is_err());
    }

    #[test]
    fn test_stats_helpers() {
        let stats = BulkheadStats {
            active_count: 3,
            queue_length: 1,
            concurrency_limit: 4,
            queue_limit: 10,
            total_accepted: 9,
            total_rejected: 1,
        };
        assert!((stats.utilization() - 0.75).abs() < f64::EPSILON);
        assert!((stats.rejection_rate() - 0.1).abs() < f64::EPSILON);
        assert!(!stats.is_at_capacity());
        assert!(stats.status_message().contains("3/4 active"));
    }

    #[tokio::test]
    async fn test_admits_immediately_under_limit() {
        let bulkhead = bulkhead(2, 2, 5000);

        let value = bulkhead.run(|| async { Ok::<_, io::Error>(7) }).await.expect("admitted");

        assert_eq!(value, 7);
        let stats = bulkhead.stats();
        assert_eq!(stats.active_count, 0);
        assert_eq!(stats.total_accepted, 1);
        assert_eq!(stats.total_rejected, 0);
    }

    #[tokio::test]
    async fn test_task_error_is_wrapped_and_slot_released() {
        let bulkhead = bulkhead(1, 0, 5000);

        let result = bulkhead.run(|| async { Err::<(), _>(io::Error::other("boom")) }).await;

        let error = result.expect_err("task failed");
        assert!(!error.is_rejection());
        assert_eq!(error.into_operation_error().map(|e| e.to_string()), Some("boom".into()));
        assert_eq!(bulkhead.stats().active_count, 0);
    }

    #[tokio::test]
    async fn test_queue_full_rejects_and_waiters_run_in_fifo_order() {
        let bulkhead = bulkhead(2, 2, 5000);
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = bulkhead.acquire().await.expect("slot 1");
        let second = bulkhead.acquire().await.expect("slot 2");
        assert!(bulkhead.stats().is_at_capacity());

        let mut waiters = Vec::new();
        for label in ["third", "fourth"] {
            let worker = Arc::clone(&bulkhead);
            let order = Arc::clone(&order);
            let queued_before = bulkhead.stats().queue_length;
            waiters.push(tokio::spawn(async move {
                worker
                    .run(|| async move {
                        order.lock().push(label);
                        Ok::<_, io::Error>(())
                    })
                    .await
            }));
            wait_for_queue(&bulkhead, queued_before + 1).await;
        }

        let fifth = bulkhead.run(|| async { Ok::<_, io::Error>(()) }).await;
        assert!(matches!(fifth, Err(ResilienceError::CapacityExceeded { queue_limit: 2 })));

        drop(first);
        drop(second);
        for waiter in waiters {
            waiter.await.expect("join").expect("queued caller admitted");
        }

        assert_eq!(*order.lock(), vec!["third", "fourth"]);
        let stats = bulkhead.stats();
        assert_eq!(stats.active_count, 0);
        assert_eq!(stats.queue_length, 0);
        assert_eq!(stats.total_accepted, 4);
        assert_eq!(stats.total_rejected, 1);
    }

    #[tokio::test]
    async fn test_zero_queue_limit_rejects_when_busy() {
        let bulkhead = bulkhead(1, 0, 5000);
        let _held = bulkhead.acquire().await.expect("slot");

        let result = bulkhead.run(|| async { Ok::<_, io::Error>(()) }).await;

        assert!(matches!(result, Err(ResilienceError::CapacityExceeded { queue_limit: 0 })));
    }

    #[tokio::test]
    async fn test_queued_caller_stays_pending_until_slot_frees() {
        let bulkhead = bulkhead(1, 1, 5000);
        let held = bulkhead.acquire().await.expect("slot");

        let mut queued = tokio_test::task::spawn(bulkhead.run(|| async { Ok::<_, io::Error>(5) }));
        tokio_test::assert_pending!(queued.poll());
        assert_eq!(bulkhead.stats().queue_length, 1);

        drop(held);
        assert!(queued.is_woken());
        assert_eq!(bulkhead.stats().active_count, 1);
        let value = tokio_test::assert_ready_ok!(queued.poll());
        assert_eq!(value, 5);
        assert_eq!(bulkhead.stats().active_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queued_caller_times_out() {
        let bulkhead = bulkhead(1, 1, 100);
        let _held = bulkhead.acquire().await.expect("slot");
        let calls = AtomicU32::new(0);

        let result = bulkhead
            .run(|| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok::<_, io::Error>(()) }
            })
            .await;

        assert!(matches!(
            result,
            Err(ResilienceError::QueueTimeout { timeout }) if timeout == Duration::from_millis(100)
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        let stats = bulkhead.stats();
        assert_eq!(stats.queue_length, 0);
        assert_eq!(stats.total_rejected, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_with_timeout_overrides_default() {
        let bulkhead = bulkhead(1, 1, 60_000);
        let _held = bulkhead.acquire().await.expect("slot");

        let result = bulkhead
            .run_with_timeout(|| async { Ok::<_, io::Error>(()) }, Duration::from_millis(20))
            .await;

        assert!(matches!(
            result,
            Err(ResilienceError::QueueTimeout { timeout }) if timeout == Duration::from_millis(20)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_waiter_leaves_queue() {
        let bulkhead = bulkhead(1, 1, 5000);
        let held = bulkhead.acquire().await.expect("slot");

        let abandoned = tokio::time::timeout(
            Duration::from_millis(10),
            bulkhead.run(|| async { Ok::<_, io::Error>(()) }),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(bulkhead.stats().queue_length, 0);

        drop(held);
        let stats = bulkhead.stats();
        assert_eq!(stats.active_count, 0);
        assert_eq!(stats.total_rejected, 0);
    }

    #[tokio::test]
    async fn test_panicking_task_releases_slot() {
        let bulkhead = bulkhead(1, 1, 5000);

        let handle = {
            let bulkhead = Arc::clone(&bulkhead);
            tokio::spawn(async move {
                bulkhead
                    .run(|| async {
                        if bulkhead.name().is_empty() {
                            return Ok::<_, io::Error>(());
                        }
                        panic!("task blew up")
                    })
                    .await
            })
        };

        assert!(handle.await.is_err());
        assert_eq!(bulkhead.stats().active_count, 0);
        bulkhead.run(|| async { Ok::<_, io::Error>(()) }).await.expect("slot reusable");
    }

    #[tokio::test]
    async fn test_emits_lifecycle_events() {
        let observer = Arc::new(RecordingObserver::new());
        let bulkhead = Arc::new(
            Bulkhead::builder("svc")
                .concurrency_limit(1)
                .queue_limit(1)
                .observer(observer.clone())
                .build()
                .expect("valid bulkhead"),
        );

        let held = bulkhead.acquire().await.expect("slot");
        let queued = {
            let bulkhead = Arc::clone(&bulkhead);
            tokio::spawn(async move { bulkhead.run(|| async { Ok::<_, io::Error>(()) }).await })
        };
        wait_for_queue(&bulkhead, 1).await;
        let _ = bulkhead.run(|| async { Ok::<_, io::Error>(()) }).await;
        drop(held);
        queued.await.expect("join").expect("admitted");

        assert_eq!(
            observer.event_names(),
            vec![
                "request:accepted",
                "request:queued",
                "request:rejected",
                "request:completed",
                "request:accepted",
                "request:completed",
            ]
        );
        let events: Vec<_> = observer.events().into_iter().map(|(_, event)| event).collect();
        // The freed slot is reported before it passes to the queued caller
        assert_eq!(events[3], ResilienceEvent::Completed { active_count: 0 });
        assert_eq!(events[4], ResilienceEvent::Accepted { active_count: 1 });
        assert!(observer.events().iter().all(|(resource, _)| resource == "svc"));
    }
}
