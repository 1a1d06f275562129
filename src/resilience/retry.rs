//! Retryable execution with exponential backoff.
//!
//! Operations against external systems classify their failures as
//! recoverable (connection loss, timeouts, transient states) or not.
//! Recoverable failures are retried with exponential backoff and jitter;
//! everything else surfaces immediately to the caller, which routes it to
//! repair or fallback handling.

use std::future::Future;
use std::time::Duration;

/// Backoff schedule: `base * 2^attempt`, capped, with up to 20% jitter.
#[derive(Clone, Copy, Debug)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub cap: Duration,
    /// Extra attempts after the first (0 = no retries).
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            max_retries: 2,
        }
    }
}

impl BackoffPolicy {
    /// Delay before retry number `attempt` (0-based).
    #[must_use]
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.cap);
        let jitter = exp.mul_f64(0.2 * rand::random::<f64>());
        exp + jitter
    }
}

/// Outcome classification an operation reports for retry decisions.
pub trait Recoverable {
    /// Whether a retry of the same operation could plausibly succeed.
    fn is_recoverable(&self) -> bool;
}

/// Run `op` up to `1 + policy.max_retries` times, sleeping between
/// recoverable failures. The last error is returned when attempts are
/// exhausted or the failure is not recoverable.
pub async fn retry_with_backoff<T, E, F, Fut>(
    policy: BackoffPolicy,
    operation_name: &str,
    mut op: F,
) -> Result<T, E>
where
    E: Recoverable + std::fmt::Display,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut attempt = 0u32;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if err.is_recoverable() && attempt < policy.max_retries => {
                let delay = policy.delay(attempt);
                tracing::warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "recoverable failure, backing off"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug)]
    struct TestError {
        recoverable: bool,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error (recoverable={})", self.recoverable)
        }
    }

    impl Recoverable for TestError {
        fn is_recoverable(&self) -> bool {
            self.recoverable
        }
    }

    fn fast_policy(max_retries: u32) -> BackoffPolicy {
        BackoffPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(5),
            max_retries,
        }
    }

    #[tokio::test]
    async fn retries_recoverable_until_success() {
        let calls = AtomicU32::new(0);
        let result: Result<u32, TestError> =
            retry_with_backoff(fast_policy(3), "test", || async {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(TestError { recoverable: true })
                } else {
                    Ok(n)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 2);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_recoverable_fails_immediately() {
        let calls = AtomicU32::new(0);
        let result: Result<(), TestError> =
            retry_with_backoff(fast_policy(3), "test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError { recoverable: false })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhausts_retry_budget() {
        let calls = AtomicU32::new(0);
        let result: Result<(), TestError> =
            retry_with_backoff(fast_policy(2), "test", || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(TestError { recoverable: true })
            })
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn delay_is_capped() {
        let policy = BackoffPolicy {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            max_retries: 10,
        };
        // 2^20 seconds would far exceed the cap; jitter adds at most 20%.
        assert!(policy.delay(20) <= Duration::from_secs(72));
    }
}
