//! Integration tests for the keyed resilience pipeline
//!
//! Covers key sharing and isolation, the breaker → retry → bulkhead nesting,
//! and observer wiring.

#![cfg(feature = "test-utils")]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use resilia::testing::{init_test_tracing, ConcurrencyGauge, FlakyTask, RecordingObserver};
use resilia::{
    CircuitState, MetricsCollector, MetricsObserver, MockClock, OperationKey, ResilienceConfig,
    ResilienceError, ResiliencePipeline,
};

struct UserService;

fn user_config() -> ResilienceConfig {
    ResilienceConfig::builder()
        .concurrency_limit(2)
        .queue_limit(2)
        .error_threshold(0.5)
        .sleep_window(Duration::from_millis(2000))
        .max_retries(2)
        .base_delay(Duration::from_millis(100))
        .cap_delay(Duration::from_secs(1))
        .build()
        .expect("valid config")
}

/// Validates that two call sites using the same key share breaker state.
///
/// # Test Steps
/// 1. Bind two handles to `UserService::get_user_data`
/// 2. Fail enough calls through the first handle to trip the breaker
/// 3. Verify the second handle observes the open circuit
/// 4. Verify an unrelated key is unaffected
#[tokio::test(start_paused = true)]
async fn test_shared_key_shares_breaker_and_distinct_keys_are_isolated() {
    init_test_tracing();
    let clock = MockClock::new();
    let pipeline = ResiliencePipeline::with_clock(clock.clone());
    let key = OperationKey::for_method::<UserService>("get_user_data");

    let first = pipeline.operation(key.clone(), user_config()).expect("valid");
    let second = pipeline.operation(key.clone(), user_config()).expect("valid");
    let orders = pipeline.operation("OrderService::list", user_config()).expect("valid");

    let failing = FlakyTask::always_failing();
    for _ in 0..11 {
        let _ = first.call(|| failing.call()).await;
    }
    // Each call retried twice before reporting one failure to the breaker
    assert_eq!(failing.calls(), 33);

    assert!(first.is_open());
    assert!(second.is_open());
    let rejected = second.call(|| async { Ok::<_, std::io::Error>(()) }).await;
    assert!(matches!(rejected, Err(ResilienceError::CircuitOpen)));

    assert!(!orders.is_open());
    orders.call(|| async { Ok::<_, std::io::Error>(()) }).await.expect("isolated key");

    assert_eq!(pipeline.len(), 2);
    assert_eq!(pipeline.breaker(&key).map(|m| m.state), Some(CircuitState::Open));
}

/// Validates the breaker recovers through the pipeline after the sleep window.
#[tokio::test(start_paused = true)]
async fn test_pipeline_recovers_after_sleep_window() {
    let clock = MockClock::new();
    let pipeline = ResiliencePipeline::with_clock(clock.clone());
    let key = OperationKey::new("UserService::get_user_data");
    let config = user_config();

    let failing = FlakyTask::always_failing();
    for _ in 0..11 {
        let _ = pipeline.execute(&key, &config, || failing.call()).await;
    }
    assert_eq!(pipeline.breaker(&key).map(|m| m.state), Some(CircuitState::Open));

    clock.advance_millis(2001);
    let healthy = FlakyTask::always_succeeding();
    let value = pipeline.execute(&key, &config, || healthy.call()).await.expect("probe");

    assert_eq!(value, "Data Success");
    assert_eq!(healthy.calls(), 1);
    assert_eq!(pipeline.breaker(&key).map(|m| m.state), Some(CircuitState::Closed));
}

/// Validates that bulkhead rejections consume retry attempts inside the breaker.
///
/// The only slot is held and the queue is disabled, so all three attempts are
/// rejected with `CapacityExceeded`; the task never runs and the breaker
/// records a single failure.
#[tokio::test(start_paused = true)]
async fn test_bulkhead_rejections_are_retried_then_recorded_once() {
    let pipeline = ResiliencePipeline::new();
    let key = OperationKey::new("ReportService::generate");
    let config = ResilienceConfig::builder()
        .concurrency_limit(1)
        .queue_limit(0)
        .max_retries(2)
        .base_delay(Duration::from_millis(10))
        .cap_delay(Duration::from_millis(50))
        .build()
        .expect("valid config");

    let unit = pipeline.get_or_create(&key, &config).expect("valid");
    let _held = unit.bulkhead().acquire().await.expect("slot");

    let calls = AtomicU32::new(0);
    let result = pipeline
        .execute(&key, &config, || {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok::<_, std::io::Error>(()) }
        })
        .await;

    assert!(matches!(result, Err(ResilienceError::CapacityExceeded { queue_limit: 0 })));
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(unit.bulkhead().stats().total_rejected, 3);
    assert_eq!(unit.breaker().metrics().failures, 1);
}

/// Validates that concurrent pipeline calls never exceed the bulkhead limit.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_calls_respect_concurrency_limit() {
    let pipeline = Arc::new(ResiliencePipeline::new());
    let key = OperationKey::new("SearchService::query");
    let config = ResilienceConfig::builder()
        .concurrency_limit(4)
        .queue_limit(200)
        .wait_timeout(Duration::from_secs(10))
        .build()
        .expect("valid config");
    let gauge = Arc::new(ConcurrencyGauge::new());

    let handles: Vec<_> = (0..40)
        .map(|i| {
            let pipeline = Arc::clone(&pipeline);
            let key = key.clone();
            let config = config.clone();
            let gauge = Arc::clone(&gauge);
            tokio::spawn(async move {
                pipeline
                    .execute(&key, &config, || {
                        let gauge = Arc::clone(&gauge);
                        async move {
                            let _inside = gauge.enter();
                            tokio::time::sleep(Duration::from_millis(2)).await;
                            Ok::<_, std::io::Error>(i)
                        }
                    })
                    .await
            })
        })
        .collect();

    let mut results = Vec::new();
    for handle in futures::future::join_all(handles).await {
        results.push(handle.expect("join").expect("admitted"));
    }
    results.sort_unstable();

    assert_eq!(results, (0..40).collect::<Vec<_>>());
    assert!(gauge.peak() <= 4, "peak concurrency {} exceeded limit", gauge.peak());
    let stats = pipeline.bulkhead(&key).expect("registered");
    assert_eq!(stats.active_count, 0);
    assert_eq!(stats.total_accepted, 40);
}

/// Validates that units report events to the pipeline's observer.
#[tokio::test]
async fn test_observer_receives_events_tagged_with_key() {
    let observer = Arc::new(RecordingObserver::new());
    let pipeline = ResiliencePipeline::new().with_observer(observer.clone());
    let operation = pipeline
        .operation("UserService::get_user_data", user_config())
        .expect("valid operation");

    operation.call(|| async { Ok::<_, std::io::Error>(1) }).await.expect("success");

    assert_eq!(observer.event_names(), vec!["request:accepted", "request:completed"]);
    assert!(observer.events().iter().all(|(resource, _)| resource == "UserService::get_user_data"));
}

#[derive(Debug, Default)]
struct CountingCollector {
    counters: AtomicU32,
}

impl MetricsCollector for CountingCollector {
    fn increment_counter(&self, _name: &str, _labels: &[(&str, &str)]) {
        self.counters.fetch_add(1, Ordering::SeqCst);
    }

    fn record_gauge(&self, _name: &str, _value: f64, _labels: &[(&str, &str)]) {}
}

/// Validates the metrics observer can be plugged into a pipeline.
#[tokio::test]
async fn test_metrics_observer_counts_events() {
    let observer = Arc::new(MetricsObserver::new(CountingCollector::default()));
    let pipeline = ResiliencePipeline::new().with_observer(observer.clone());
    let key = OperationKey::new("Inventory::reserve");

    for _ in 0..3 {
        pipeline
            .execute(&key, &user_config(), || async { Ok::<_, std::io::Error>(()) })
            .await
            .expect("success");
    }

    // accepted + completed per call
    assert_eq!(observer.collector().counters.load(Ordering::SeqCst), 6);
}
