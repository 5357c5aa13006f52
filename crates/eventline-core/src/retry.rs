//! Retry Logic with Backoff
//!
//! Store and transport calls are retried locally by their callers with the
//! policy defined here. Errors are split into retryable (timeouts, dropped
//! connections, throttling) and non-retryable (authorization failures,
//! missing resources, bad requests); the caller supplies the classifier
//! because each layer has its own error type.
//!
//! ```text
//! ┌──────────────────────────────┐
//! │  RetryPolicy                 │
//! │  - mode: Exponential         │
//! │  - max_retries: 3            │
//! │  - delay: 800ms              │
//! │  - max_delay: 60s            │
//! │  - try_timeout: 60s          │
//! └──────┬───────────────────────┘
//!        │
//!        ├─→ Attempt 1: immediate
//!        ├─→ Attempt 2: wait 800ms
//!        ├─→ Attempt 3: wait 1.6s
//!        └─→ Attempt 4: wait 3.2s
//! ```

use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

/// How the delay between attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryMode {
    /// The same delay between every attempt.
    Fixed,
    /// Delay doubles each attempt, capped at `max_delay`.
    Exponential,
}

/// Retry configuration for store and transport operations.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Backoff growth mode.
    pub mode: RetryMode,

    /// Maximum number of retry attempts after the initial try.
    pub max_retries: u32,

    /// Base delay between attempts.
    pub delay: Duration,

    /// Upper bound on the delay between attempts.
    pub max_delay: Duration,

    /// Timeout applied to each individual attempt.
    pub try_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            mode: RetryMode::Exponential,
            max_retries: 3,
            delay: Duration::from_millis(800),
            max_delay: Duration::from_secs(60),
            try_timeout: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (0-indexed), capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let raw = match self.mode {
            RetryMode::Fixed => self.delay,
            RetryMode::Exponential => {
                let factor = 2u32.saturating_pow(attempt).min(1 << 16);
                self.delay.saturating_mul(factor)
            }
        };
        raw.min(self.max_delay)
    }
}

/// Retry `operation` with backoff until it succeeds, fails permanently, or
/// exhausts `policy.max_retries`.
///
/// `is_retryable` classifies errors; a non-retryable error is returned
/// immediately. The per-attempt timeout is the caller's responsibility
/// (wrap the operation body in `tokio::time::timeout` and map the elapsed
/// error into the operation's own error type).
pub async fn retry_with_backoff<F, Fut, T, E>(
    policy: &RetryPolicy,
    is_retryable: impl Fn(&E) -> bool,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    debug!(attempt = attempt + 1, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(error) => {
                if !is_retryable(&error) {
                    return Err(error);
                }

                if attempt >= policy.max_retries {
                    warn!(
                        attempt = attempt + 1,
                        max_retries = policy.max_retries,
                        error = %error,
                        "retries exhausted, giving up"
                    );
                    return Err(error);
                }

                let backoff = policy.backoff(attempt);
                debug!(
                    attempt = attempt + 1,
                    backoff_ms = backoff.as_millis() as u64,
                    error = %error,
                    "retryable error, backing off"
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

    #[derive(Debug)]
    struct TestError {
        retryable: bool,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "test error (retryable={})", self.retryable)
        }
    }

    #[test]
    fn test_default_policy() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.mode, RetryMode::Exponential);
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.delay, Duration::from_millis(800));
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = RetryPolicy {
            mode: RetryMode::Exponential,
            delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(100));
        assert_eq!(policy.backoff(1), Duration::from_millis(200));
        assert_eq!(policy.backoff(2), Duration::from_millis(400));
        assert_eq!(policy.backoff(3), Duration::from_millis(800));
    }

    #[test]
    fn test_exponential_backoff_caps_at_max() {
        let policy = RetryPolicy {
            mode: RetryMode::Exponential,
            delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(4),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(0), Duration::from_secs(1));
        assert_eq!(policy.backoff(1), Duration::from_secs(2));
        assert_eq!(policy.backoff(2), Duration::from_secs(4));
        assert_eq!(policy.backoff(10), Duration::from_secs(4));
    }

    #[test]
    fn test_fixed_backoff() {
        let policy = RetryPolicy {
            mode: RetryMode::Fixed,
            delay: Duration::from_millis(250),
            ..RetryPolicy::default()
        };
        assert_eq!(policy.backoff(0), Duration::from_millis(250));
        assert_eq!(policy.backoff(5), Duration::from_millis(250));
    }

    #[tokio::test]
    async fn test_succeeds_first_try() {
        let policy = RetryPolicy::default();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result = retry_with_backoff(&policy, |e: &TestError| e.retryable, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<i32, TestError>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_eventual_success() {
        let policy = RetryPolicy {
            delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result = retry_with_backoff(&policy, |e: &TestError| e.retryable, || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(TestError { retryable: true })
                } else {
                    Ok::<i32, TestError>(7)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 7);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_non_retryable_returns_immediately() {
        let policy = RetryPolicy::default();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result = retry_with_backoff(&policy, |e: &TestError| e.retryable, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<i32, TestError>(TestError { retryable: false })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let policy = RetryPolicy {
            max_retries: 2,
            delay: Duration::from_millis(1),
            ..RetryPolicy::default()
        };
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();

        let result = retry_with_backoff(&policy, |e: &TestError| e.retryable, || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<i32, TestError>(TestError { retryable: true })
            }
        })
        .await;

        assert!(result.is_err());
        // Initial attempt + 2 retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
