//! Retry utilities for calls to remote dependencies.
//!
//! Provides configurable retry logic with exponential backoff and a per-attempt
//! timeout. Whether an error is worth retrying is decided by the error type
//! itself through [`RetryClass`].

use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

/// Configuration for retry behavior.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not including the initial attempt).
    pub max_retries: u32,
    /// Initial backoff duration before first retry.
    pub initial_backoff: Duration,
    /// Maximum backoff duration.
    pub max_backoff: Duration,
    /// Backoff multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to backoff duration.
    pub add_jitter: bool,
    /// Upper bound on a single attempt.
    pub attempt_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            add_jitter: true,
            attempt_timeout: Duration::from_secs(10),
        }
    }
}

impl RetryConfig {
    /// Create a config for quick retries (smaller backoffs), used by tests.
    pub fn quick() -> Self {
        Self {
            max_retries: 2,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(50),
            backoff_multiplier: 2.0,
            add_jitter: false,
            attempt_timeout: Duration::from_secs(2),
        }
    }

    /// Calculate backoff duration for a given attempt.
    pub fn backoff_duration(&self, attempt: u32) -> Duration {
        let backoff =
            self.initial_backoff.as_millis() as f64 * self.backoff_multiplier.powi(attempt as i32);
        let backoff_ms = backoff.min(self.max_backoff.as_millis() as f64) as u64;

        let mut duration = Duration::from_millis(backoff_ms);

        if self.add_jitter {
            // Up to 25% jitter
            let jitter = (backoff_ms as f64 * 0.25 * rand::random::<f64>()) as u64;
            duration += Duration::from_millis(jitter);
        }

        duration
    }
}

/// Classification an error type gives the retry loop.
pub trait RetryClass: Display {
    /// Network-class failures that may succeed on a later attempt.
    fn is_transient(&self) -> bool;

    /// Server-provided minimum wait before the next attempt.
    fn retry_after(&self) -> Option<Duration> {
        None
    }

    /// Error to report when a single attempt exceeds its timeout.
    fn timed_out(operation: &str, after: Duration) -> Self;
}

/// Execute a remote call with retry logic.
///
/// Permanent failures return immediately. Transient failures are retried up to
/// `config.max_retries` times, waiting the larger of the computed backoff and
/// the error's own `retry_after` hint.
pub async fn retry_call<F, Fut, T, E>(config: &RetryConfig, operation_name: &str, f: F) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: RetryClass,
{
    let mut attempt = 0;

    loop {
        let outcome = match timeout(config.attempt_timeout, f()).await {
            Ok(result) => result,
            Err(_) => Err(E::timed_out(operation_name, config.attempt_timeout)),
        };

        match outcome {
            Ok(result) => {
                if attempt > 0 {
                    info!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        "Remote call succeeded after retry"
                    );
                }
                return Ok(result);
            }
            Err(err) => {
                if !err.is_transient() {
                    warn!(
                        operation = operation_name,
                        error = %err,
                        "Remote call failed with permanent error, not retrying"
                    );
                    return Err(err);
                }

                if attempt >= config.max_retries {
                    warn!(
                        operation = operation_name,
                        attempt = attempt + 1,
                        error = %err,
                        "Remote call failed after max retries"
                    );
                    return Err(err);
                }

                let mut backoff = config.backoff_duration(attempt);
                if let Some(hint) = err.retry_after() {
                    backoff = backoff.max(hint.min(config.max_backoff));
                }

                warn!(
                    operation = operation_name,
                    attempt = attempt + 1,
                    error = %err,
                    backoff_ms = backoff.as_millis() as u64,
                    "Remote call failed, retrying after backoff"
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
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Flaky,
        Fatal,
        Timeout,
    }

    impl Display for TestError {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl RetryClass for TestError {
        fn is_transient(&self) -> bool {
            matches!(self, TestError::Flaky | TestError::Timeout)
        }

        fn timed_out(_operation: &str, _after: Duration) -> Self {
            TestError::Timeout
        }
    }

    #[test]
    fn test_backoff_duration() {
        let config = RetryConfig {
            initial_backoff: Duration::from_millis(100),
            add_jitter: false,
            ..Default::default()
        };

        assert_eq!(config.backoff_duration(0), Duration::from_millis(100));
        assert_eq!(config.backoff_duration(1), Duration::from_millis(200));
        assert_eq!(config.backoff_duration(2), Duration::from_millis(400));
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RetryConfig {
            initial_backoff: Duration::from_secs(4),
            max_backoff: Duration::from_secs(5),
            add_jitter: false,
            ..Default::default()
        };
        assert_eq!(config.backoff_duration(3), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn test_retry_success_first_attempt() {
        let config = RetryConfig::quick();
        let result = retry_call(&config, "test_op", || async { Ok::<_, TestError>(42) }).await;
        assert_eq!(result.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = RetryConfig::quick();
        let counter = calls.clone();
        let result = retry_call(&config, "test_op", move || {
            let counter = counter.clone();
            async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(TestError::Flaky)
                } else {
                    Ok(7)
                }
            }
        })
        .await;
        assert_eq!(result.unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_permanent_failure_is_not_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = RetryConfig::quick();
        let counter = calls.clone();
        let result = retry_call(&config, "test_op", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(TestError::Fatal)
            }
        })
        .await;
        assert_eq!(result.unwrap_err(), TestError::Fatal);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let config = RetryConfig::quick();
        let counter = calls.clone();
        let result = retry_call(&config, "test_op", move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<i32, _>(TestError::Flaky)
            }
        })
        .await;
        assert_eq!(result.unwrap_err(), TestError::Flaky);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_slow_attempt_times_out() {
        let config = RetryConfig {
            max_retries: 0,
            attempt_timeout: Duration::from_millis(10),
            ..RetryConfig::quick()
        };
        let result = retry_call(&config, "slow_op", || async {
            sleep(Duration::from_millis(200)).await;
            Ok::<_, TestError>(1)
        })
        .await;
        assert_eq!(result.unwrap_err(), TestError::Timeout);
    }
}
