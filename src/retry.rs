//! Generic retry-with-backoff helper.
//!
//! Shared by the remote client's HTTP calls and anything else that wraps a
//! fallible async operation in exponential backoff. Retryability is decided
//! by the operation's error type via [`IsRetryable`] (see `error.rs`), not by
//! this module, so the same loop works for remote HTTP errors today and any
//! other transient-vs-permanent error classification later.
//!
//! ```no_run
//! use relay_sync_agent::config::RetryConfig;
//! use relay_sync_agent::retry::with_retry;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RetryConfig::default();
//! let result = with_retry(&config, || async { Ok::<_, std::io::Error>(42) }).await;
//! # let _ = result;
//! # Ok(())
//! # }
//! ```

use crate::config::RetryConfig;
use crate::error::IsRetryable;
use rand::Rng;
use std::future::Future;
use std::time::Duration;

/// Run `operation`, retrying with exponential backoff while the returned
/// error reports itself as retryable and the attempt budget in `config` has
/// not been exhausted.
///
/// `operation` is called at least once. On the first success, or once the
/// error is non-retryable or the attempt budget runs out, the result is
/// returned as-is.
pub async fn with_retry<F, Fut, T, E>(config: &RetryConfig, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: IsRetryable + std::fmt::Display,
{
    let mut attempt = 0;
    let mut delay = config.initial_delay;

    loop {
        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(attempt, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(e) if e.is_retryable() && attempt < config.max_attempts => {
                attempt += 1;
                let computed = if config.jitter { add_jitter(delay) } else { delay };
                let wait = honor_retry_after(computed, e.retry_after());
                tracing::warn!(
                    attempt,
                    max_attempts = config.max_attempts,
                    delay_ms = wait.as_millis() as u64,
                    error = %e,
                    "retryable error, backing off"
                );
                tokio::time::sleep(wait).await;
                delay = delay
                    .mul_f64(config.backoff_multiplier)
                    .min(config.max_delay);
            }
            Err(e) => {
                if e.is_retryable() {
                    tracing::error!(attempt, error = %e, "retries exhausted");
                } else {
                    tracing::debug!(error = %e, "non-retryable error");
                }
                return Err(e);
            }
        }
    }
}

/// Apply a server-supplied `Retry-After` hint as the next backoff delay,
/// ignoring the computed exponential delay for this one attempt. Consulted
/// automatically by [`with_retry`] via [`IsRetryable::retry_after`] — a 429
/// response's `Retry-After` header overrides the usual exponential wait.
pub fn honor_retry_after(computed: Duration, retry_after: Option<Duration>) -> Duration {
    retry_after.unwrap_or(computed)
}

fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered_secs)
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RemoteError;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[derive(Debug)]
    enum TestError {
        Transient,
        Permanent,
    }

    impl std::fmt::Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                TestError::Transient => write!(f, "transient error"),
                TestError::Permanent => write!(f, "permanent error"),
            }
        }
    }

    impl IsRetryable for TestError {
        fn is_retryable(&self) -> bool {
            matches!(self, TestError::Transient)
        }
    }

    #[tokio::test]
    async fn success_without_retry_calls_once() {
        let config = RetryConfig::default();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&config, || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TestError>(42)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(counter.load(Ordering::SeqCst), 1, "should only call once");
    }

    #[tokio::test]
    async fn transient_then_succeed_retries_until_success() {
        let config = RetryConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: false,
        };

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&config, || {
            let counter = counter_clone.clone();
            async move {
                let count = counter.fetch_add(1, Ordering::SeqCst);
                if count < 2 {
                    Err(TestError::Transient)
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert_eq!(
            counter.load(Ordering::SeqCst),
            3,
            "should retry twice before success"
        );
    }

    #[tokio::test]
    async fn exhausted_retries_return_last_error() {
        let config = RetryConfig {
            max_attempts: 2,
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: false,
        };

        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&config, || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(TestError::Transient)
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(
            counter.load(Ordering::SeqCst),
            3,
            "should try initial + 2 retries"
        );
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let config = RetryConfig::default();
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result = with_retry(&config, || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(TestError::Permanent)
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn remote_error_classification_feeds_retry_loop() {
        let config = RetryConfig {
            max_attempts: 1,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let result: Result<(), RemoteError> = with_retry(&config, || {
            let counter = counter_clone.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err(RemoteError::Client {
                    status: 404,
                    body: "not found".into(),
                })
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(counter.load(Ordering::SeqCst), 1, "404 is not retryable");
    }

    #[test]
    fn retry_after_hint_overrides_computed_delay() {
        let computed = Duration::from_secs(2);
        let hint = Duration::from_secs(30);
        assert_eq!(honor_retry_after(computed, Some(hint)), hint);
        assert_eq!(honor_retry_after(computed, None), computed);
    }

    #[derive(Debug)]
    struct RateLimitedError;

    impl std::fmt::Display for RateLimitedError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "rate limited")
        }
    }

    impl IsRetryable for RateLimitedError {
        fn is_retryable(&self) -> bool {
            true
        }

        fn retry_after(&self) -> Option<Duration> {
            Some(Duration::from_millis(200))
        }
    }

    #[tokio::test]
    async fn with_retry_waits_the_retry_after_hint_not_the_computed_backoff() {
        // initial_delay is tiny; retry_after's 200ms hint should dominate,
        // proving the loop consults the error's hint rather than always
        // using its own exponential schedule.
        let config = RetryConfig {
            max_attempts: 1,
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_secs(1),
            backoff_multiplier: 2.0,
            jitter: false,
        };
        let counter = Arc::new(AtomicU32::new(0));
        let counter_clone = counter.clone();

        let started = std::time::Instant::now();
        let result = with_retry(&config, || {
            let counter = counter_clone.clone();
            async move {
                let count = counter.fetch_add(1, Ordering::SeqCst);
                if count == 0 {
                    Err(RateLimitedError)
                } else {
                    Ok(42)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 42);
        assert!(
            started.elapsed() >= Duration::from_millis(180),
            "should have waited close to the 200ms retry_after hint, elapsed={:?}",
            started.elapsed()
        );
    }
}
