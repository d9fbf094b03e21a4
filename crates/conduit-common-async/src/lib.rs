//! Async utilities shared by the Conduit crates.

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

pub mod backoff;

pub use backoff::{retry, BackoffPolicy, RetryError, Retryable};
pub use tokio_util::sync::CancellationToken;

/// Run a future with a timeout.
pub async fn with_timeout<F, T>(duration: Duration, future: F) -> Result<T, TimeoutError>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| TimeoutError { after: duration })
}

/// Timeout error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation timed out after {after:?}")]
pub struct TimeoutError {
    pub after: Duration,
}

/// Roughly 30 years; the same horizon tokio uses for unbounded timers.
const FAR_FUTURE: Duration = Duration::from_secs(86400 * 365 * 30);

/// The instant `after` past `start`.
///
/// Durations too large to represent saturate to a far-future instant, so
/// an effectively unbounded wait never panics.
pub fn deadline(start: Instant, after: Duration) -> Instant {
    start
        .checked_add(after)
        .unwrap_or_else(|| start + FAR_FUTURE)
}

/// Run multiple futures concurrently, returning when all complete.
pub async fn join_all<I, F, T>(futures: I) -> Vec<T>
where
    I: IntoIterator<Item = F>,
    F: Future<Output = T>,
{
    futures::future::join_all(futures).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_timeout_success() {
        let result = with_timeout(Duration::from_secs(1), async { 42 }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_failure() {
        let result = with_timeout(Duration::from_millis(10), async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            42
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(err.after, Duration::from_millis(10));
        assert_eq!(err.to_string(), "operation timed out after 10ms");
    }

    #[tokio::test(start_paused = true)]
    async fn test_deadline_saturates() {
        let start = Instant::now();

        assert_eq!(deadline(start, Duration::from_secs(5)), start + Duration::from_secs(5));
        assert_eq!(deadline(start, Duration::MAX), start + FAR_FUTURE);

        let waited = tokio::time::timeout_at(deadline(start, Duration::MAX), async { 7 }).await;
        assert_eq!(waited.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_join_all() {
        let futures: Vec<_> = (1..=3).map(|i| async move { i }).collect();
        let results = join_all(futures).await;
        assert_eq!(results, vec![1, 2, 3]);
    }
}
