//! Exponential backoff for transient I/O against the store, bus and coordinator

use std::future::Future;
use std::time::Duration;

use serde::Deserialize;
use tokio::time::sleep;
use tracing::{debug, warn};

/// Errors that may succeed when the operation is attempted again
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

/// Basic retry policy template
#[derive(Debug, Deserialize, Clone, Copy)]
pub struct BackoffPolicy {
    /// Maximum number of attempts (0 means a single attempt)
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,

    /// Backoff base (unit: milliseconds)
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum backoff time (unit: milliseconds)
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_retries() -> usize {
    5
}
fn default_base_delay_ms() -> u64 {
    100
}
fn default_max_delay_ms() -> u64 {
    5000
}

impl BackoffPolicy {
    /// Delay before attempt `attempt` (zero-based) is retried
    pub fn delay(&self, attempt: usize) -> Duration {
        let factor = 1u64.checked_shl(attempt.min(32) as u32).unwrap_or(u64::MAX);
        let delay = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(delay)
    }
}

/// Run `task` until it succeeds, fails permanently, or the policy is exhausted
///
/// Returns the last error when every attempt failed.
pub async fn retry_with_backoff<F, Fut, T, E>(what: &str, policy: BackoffPolicy, mut task: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Retryable + std::fmt::Display,
{
    let attempts = policy.max_retries.max(1);
    let mut attempt = 0;

    loop {
        match task().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt + 1 < attempts => {
                let delay = policy.delay(attempt);
                warn!("{what} failed (attempt {}/{attempts}): {e}", attempt + 1);
                debug!("retrying {what} in {delay:?}");
                sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Debug)]
    struct Flaky(bool);

    impl std::fmt::Display for Flaky {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "flaky (retryable: {})", self.0)
        }
    }

    impl Retryable for Flaky {
        fn is_retryable(&self) -> bool {
            self.0
        }
    }

    #[test]
    fn test_delay_doubles_until_cap() {
        let policy = BackoffPolicy {
            max_retries: 10,
            base_delay_ms: 100,
            max_delay_ms: 1000,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(1), Duration::from_millis(200));
        assert_eq!(policy.delay(3), Duration::from_millis(800));
        assert_eq!(policy.delay(4), Duration::from_millis(1000));
        assert_eq!(policy.delay(60), Duration::from_millis(1000));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors_then_succeeds() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<u32, Flaky> = retry_with_backoff("op", BackoffPolicy::default(), || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(Flaky(true))
                } else {
                    Ok(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let result: Result<u32, Flaky> = retry_with_backoff("op", BackoffPolicy::default(), || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(Flaky(false)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let policy = BackoffPolicy {
            max_retries: 3,
            ..Default::default()
        };

        let result: Result<u32, Flaky> = retry_with_backoff("op", policy, || {
            counter.fetch_add(1, Ordering::SeqCst);
            async { Err(Flaky(true)) }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
