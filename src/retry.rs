//! Standalone retry/backoff envelope usable by any async operation.
//!
//! Grounded in the inline `RetryConfig` / `complete_with_retry` loop
//! (`gateway/batch.rs`), lifted out of the batch executor and
//! generalized: error-kind classification now lives on `Error::is_retryable`
//! instead of ad hoc string matching, attempts emit a caller-supplied
//! callback (used by the orchestrator to append retry events), a per-attempt
//! timeout wraps each call, and a `maximum_attempts` cap with jitter
//! replaces an unconditionally-retrying loop.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio::time::{sleep, timeout};

use crate::error::Error;

/// Configuration for one retry envelope instance.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_interval: Duration,
    pub backoff_coefficient: f64,
    pub maximum_interval: Duration,
    pub maximum_attempts: u32,
    pub timeout_per_attempt: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_millis(200),
            backoff_coefficient: 2.0,
            maximum_interval: Duration::from_secs(30),
            maximum_attempts: 3,
            timeout_per_attempt: Duration::from_secs(60),
        }
    }
}

impl RetryConfig {
    /// `min(maximum_interval, initial_interval * backoff_coefficient^(attempt-1))`
    /// plus small jitter.
    fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = self.backoff_coefficient.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_interval.as_millis() as f64 * factor) as u64;
        let base = Duration::from_millis(millis).min(self.maximum_interval);
        let jitter_ms = rand::thread_rng().gen_range(0..=(base.as_millis() as u64 / 10).max(1));
        base + Duration::from_millis(jitter_ms)
    }
}

/// Record of one retry attempt, for the orchestrator to turn into an
/// EventRecord.
#[derive(Debug, Clone)]
pub struct AttemptOutcome {
    pub attempt: u32,
    pub succeeded: bool,
    pub error: Option<String>,
}

/// Run `op` under the retry envelope. `on_attempt` is invoked after every
/// attempt (success or failure) so callers can log/emit events without the
/// envelope needing to know about an event log.
///
/// On final failure, returns `fallback()` if provided, else the last error.
pub async fn retry_with<F, Fut, T, Fb>(
    config: &RetryConfig,
    mut op: F,
    mut on_attempt: impl FnMut(AttemptOutcome),
    fallback: Option<Fb>,
) -> Result<T, Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Error>>,
    Fb: FnOnce() -> T,
{
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        let attempt_result = timeout(config.timeout_per_attempt, op()).await;
        let outcome = match attempt_result {
            Ok(Ok(value)) => {
                on_attempt(AttemptOutcome {
                    attempt,
                    succeeded: true,
                    error: None,
                });
                return Ok(value);
            }
            Ok(Err(error)) => error,
            Err(_) => Error::transient_remote("gateway", "per-attempt timeout elapsed"),
        };

        let retryable = outcome.is_retryable();
        on_attempt(AttemptOutcome {
            attempt,
            succeeded: false,
            error: Some(outcome.to_string()),
        });

        if !retryable || attempt >= config.maximum_attempts {
            return match fallback {
                Some(f) => Ok(f()),
                None => Err(outcome),
            };
        }

        sleep(config.delay_for_attempt(attempt)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn succeeds_first_try_without_retry() {
        let config = RetryConfig::default();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = attempts.clone();
        let result: Result<u32, Error> = retry_with(
            &config,
            move || {
                attempts2.fetch_add(1, Ordering::SeqCst);
                async { Ok(42u32) }
            },
            |_| {},
            None::<fn() -> u32>,
        )
        .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retries_transient_errors_up_to_max_attempts() {
        let config = RetryConfig {
            initial_interval: Duration::from_millis(1),
            maximum_interval: Duration::from_millis(5),
            maximum_attempts: 3,
            timeout_per_attempt: Duration::from_secs(5),
            ..RetryConfig::default()
        };
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = attempts.clone();
        let result: Result<u32, Error> = retry_with(
            &config,
            move || {
                attempts2.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::transient_remote("model_api", "503")) }
            },
            |_| {},
            None::<fn() -> u32>,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn non_retryable_error_stops_immediately() {
        let config = RetryConfig::default();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts2 = attempts.clone();
        let result: Result<u32, Error> = retry_with(
            &config,
            move || {
                attempts2.fetch_add(1, Ordering::SeqCst);
                async { Err(Error::validation("bad input")) }
            },
            |_| {},
            None::<fn() -> u32>,
        )
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn fallback_is_used_on_exhausted_retries() {
        let config = RetryConfig {
            initial_interval: Duration::from_millis(1),
            maximum_attempts: 2,
            timeout_per_attempt: Duration::from_secs(5),
            ..RetryConfig::default()
        };
        let result: Result<u32, Error> = retry_with(
            &config,
            || async { Err(Error::transient_remote("model_api", "timeout")) },
            |_| {},
            Some(|| 0u32),
        )
        .await;
        assert_eq!(result.unwrap(), 0);
    }
}
