//! Async testing utilities

use std::future::Future;
use std::time::Duration;

/// Assert that an async condition becomes true within a timeout
///
/// The condition is re-evaluated every 10ms.
///
/// ```no_run
/// # #[cfg(feature = "test-utils")]
/// # async fn example(bulkhead: resilia::Bulkhead) {
/// use std::time::Duration;
///
/// resilia::assert_eventually_async!(Duration::from_secs(1), async {
///     bulkhead.stats().queue_length == 2
/// });
/// # }
/// ```
#[macro_export]
macro_rules! assert_eventually_async {
    ($timeout:expr, $fut:expr) => {{
        let timeout_duration = $timeout;
        let result = tokio::time::timeout(timeout_duration, async {
            loop {
                if $fut.await {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            }
        })
        .await;

        assert!(result.is_ok(), "Condition did not become true within {:?}", timeout_duration);
    }};
}

/// Await `future`, panicking if it takes longer than `timeout`
pub async fn timeout_ok<F, T>(timeout: Duration, future: F) -> T
where
    F: Future<Output = T>,
{
    match tokio::time::timeout(timeout, future).await {
        Ok(value) => value,
        Err(_) => panic!("future did not complete within {timeout:?}"),
    }
}
