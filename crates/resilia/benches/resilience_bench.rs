//! Resilience benchmarks
//!
//! Hot paths of the breaker, bulkhead and pipeline plus backoff calculation.
//!
//! Run with: `cargo bench --bench resilience_bench -p resilia --features test-utils`

use std::sync::Arc;
use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use resilia::{
    Bulkhead, CircuitBreaker, MockClock, NoOpObserver, OperationKey, ResilienceConfig,
    ResilienceError, ResiliencePipeline, RetryPolicy,
};
use tokio::runtime::Builder as RuntimeBuilder;

fn runtime() -> tokio::runtime::Runtime {
    RuntimeBuilder::new_current_thread()
        .enable_time()
        .build()
        .expect("tokio runtime for benchmarks")
}

// ============================================================================
// Circuit Breaker Benchmarks
// ============================================================================

fn bench_circuit_breaker(c: &mut Criterion) {
    let mut group = c.benchmark_group("circuit_breaker");
    let runtime = runtime();

    group.bench_function("execute_closed", |b| {
        let breaker = CircuitBreaker::builder("bench")
            .observer(Arc::new(NoOpObserver))
            .build()
            .expect("valid breaker");
        b.to_async(&runtime).iter(|| async {
            let result: Result<_, ResilienceError<std::io::Error>> =
                breaker.execute(|| async { Ok(black_box(1)) }).await;
            black_box(result)
        });
    });

    group.bench_function("execute_open_rejection", |b| {
        let breaker = CircuitBreaker::builder("bench")
            .observer(Arc::new(NoOpObserver))
            .clock(MockClock::new())
            .build()
            .expect("valid breaker");
        for _ in 0..11 {
            breaker.record(false);
        }
        b.to_async(&runtime).iter(|| async {
            let result: Result<(), ResilienceError<std::io::Error>> =
                breaker.execute(|| async { Ok(()) }).await;
            black_box(result)
        });
    });

    group.bench_function("record_rolling_window", |b| {
        let clock = MockClock::new();
        let breaker = CircuitBreaker::builder("bench")
            .threshold(1.0)
            .observer(Arc::new(NoOpObserver))
            .clock(clock.clone())
            .build()
            .expect("valid breaker");
        b.iter(|| {
            clock.advance_millis(250);
            breaker.record(black_box(true));
        });
    });

    group.finish();
}

// ============================================================================
// Bulkhead and Pipeline Benchmarks
// ============================================================================

fn bench_bulkhead_and_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("bulkhead_pipeline");
    let runtime = runtime();

    group.bench_function("bulkhead_uncontended", |b| {
        let bulkhead = Bulkhead::builder("bench")
            .observer(Arc::new(NoOpObserver))
            .build()
            .expect("valid bulkhead");
        b.to_async(&runtime).iter(|| async {
            black_box(bulkhead.run(|| async { Ok::<_, std::io::Error>(1) }).await)
        });
    });

    group.bench_function("pipeline_execute_cached_key", |b| {
        let pipeline = ResiliencePipeline::new().with_observer(Arc::new(NoOpObserver));
        let key = OperationKey::new("Bench::call");
        let config = ResilienceConfig::default();
        b.to_async(&runtime).iter(|| async {
            black_box(
                pipeline.execute(&key, &config, || async { Ok::<_, std::io::Error>(1) }).await,
            )
        });
    });

    group.finish();
}

// ============================================================================
// Retry Backoff Benchmarks
// ============================================================================

fn bench_retry_backoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("retry_backoff");
    let policy = RetryPolicy::new(10, Duration::from_millis(100), Duration::from_secs(10));

    for attempt in [0_u32, 3, 8, 31] {
        group.bench_with_input(BenchmarkId::new("backoff_delay", attempt), &attempt, |b, &n| {
            b.iter(|| black_box(policy.backoff_delay(black_box(n))));
        });
    }

    group.finish();
}

criterion_group!(resilience, bench_circuit_breaker, bench_bulkhead_and_pipeline, bench_retry_backoff);
criterion_main!(resilience);
