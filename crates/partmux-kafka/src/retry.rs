//! Exponential backoff for backend connection failures
//!
//! Broker connections fail transiently during rolling restarts and leader
//! moves. Operations that hit a retriable [`ProxyError`] are repeated with a
//! growing delay:
//!
//! ```text
//! attempt 1: immediate
//! attempt 2: wait 100ms
//! attempt 3: wait 200ms
//! attempt 4: wait 400ms
//! ...        capped at max_backoff
//! ```
//!
//! Non-retriable errors (protocol violations, invalid partitions) are returned
//! on the first failure.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;
use tracing::{debug, warn};

use crate::error::{ProxyError, ProxyResult};

/// Retry policy configuration for exponential backoff.
///
/// ```text
/// backoff = min(initial_backoff * multiplier^attempt, max_backoff)
/// ```
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Maximum number of retry attempts after the first try
    pub max_retries: usize,

    /// Delay before the first retry
    pub initial_backoff: Duration,

    /// Upper bound for any single delay
    pub max_backoff: Duration,

    /// Growth factor between consecutive delays
    pub backoff_multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(5),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    pub fn new(
        max_retries: usize,
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_retries,
            initial_backoff,
            max_backoff,
            backoff_multiplier,
        }
    }

    /// Delay before retry number `attempt` (0-indexed)
    pub fn backoff(&self, attempt: usize) -> Duration {
        let backoff_ms =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff = Duration::from_millis(backoff_ms as u64);
        backoff.min(self.max_backoff)
    }

    pub fn is_retriable(&self, error: &ProxyError) -> bool {
        error.is_retriable()
    }
}

/// Run `operation` until it succeeds, fails with a non-retriable error, or
/// the policy's retries are exhausted. The last error is returned.
pub async fn retry_with_backoff<F, Fut, T>(policy: &RetryPolicy, mut operation: F) -> ProxyResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = ProxyResult<T>>,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "Backend operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(err) => {
                if !policy.is_retriable(&err) {
                    return Err(err);
                }

                if attempt >= policy.max_retries {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        error = %err,
                        "Max retries exhausted, giving up"
                    );
                    return Err(err);
                }

                let backoff = policy.backoff(attempt);
                debug!(
                    attempt = attempt + 1,
                    max_retries = policy.max_retries,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %err,
                    "Retriable backend error, backing off"
                );

                sleep(backoff).await;
                attempt += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn fast_policy(max_retries: usize) -> RetryPolicy {
        RetryPolicy::new(max_retries, Duration::from_millis(1), Duration::from_millis(5), 2.0)
    }

    #[test]
    fn test_backoff_exponential_growth_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn test_backoff_max_cap() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(10), Duration::from_secs(5));
        assert_eq!(policy.backoff(50), Duration::from_secs(5));
    }

    #[test]
    fn test_backoff_with_multiplier_1_no_growth() {
        let policy = RetryPolicy::new(3, Duration::from_millis(250), Duration::from_secs(1), 1.0);
        for attempt in 0..5 {
            assert_eq!(policy.backoff(attempt), Duration::from_millis(250));
        }
    }

    #[tokio::test]
    async fn test_retry_succeeds_after_transient_failures() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result = retry_with_backoff(&fast_policy(5), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(ProxyError::BackendUnavailable("broker 1".to_string()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_stops_on_non_retriable_error() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: ProxyResult<()> = retry_with_backoff(&fast_policy(5), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ProxyError::Protocol("truncated frame".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(ProxyError::Protocol(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retry_exhausts_attempts() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: ProxyResult<()> = retry_with_backoff(&fast_policy(2), || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(ProxyError::ConnectionClosed)
            }
        })
        .await;

        assert!(matches!(result, Err(ProxyError::ConnectionClosed)));
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
