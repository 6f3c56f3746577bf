//! Bounded retry with exponential backoff and jitter.
//!
//! An explicit loop carries the remaining-attempt count and the backoff
//! state; the outcome is a tagged result rather than an unwound exception.
//! Only [`ExchangeError::Temporary`] is retried.

use std::future::Future;
use std::time::Duration;

use backoff::backoff::Backoff;
use backoff::ExponentialBackoff;
use thiserror::Error;
use tracing::warn;

use super::ExchangeError;

/// Terminal outcome of a retried operation.
#[derive(Debug, Error)]
pub enum RetryError {
    /// The retry budget ran out while the failure stayed temporary.
    #[error("{operation} failed after {attempts} attempts: {source}")]
    Exhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: ExchangeError,
    },

    /// A non-retryable failure, surfaced on first occurrence.
    #[error(transparent)]
    Aborted(#[from] ExchangeError),
}

impl RetryError {
    /// The underlying exchange failure, regardless of how the retry ended.
    pub fn into_inner(self) -> ExchangeError {
        match self {
            RetryError::Exhausted { source, .. } => source,
            RetryError::Aborted(source) => source,
        }
    }

    pub fn inner(&self) -> &ExchangeError {
        match self {
            RetryError::Exhausted { source, .. } => source,
            RetryError::Aborted(source) => source,
        }
    }
}

/// Retry configuration shared by all gateway call sites.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    initial_interval: Duration,
    max_interval: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 4,
            initial_interval: Duration::from_millis(200),
            max_interval: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, initial_interval: Duration, max_interval: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_interval,
            max_interval,
        }
    }

    /// Policy without sleeps, for tests.
    #[cfg(test)]
    pub fn immediate(max_attempts: u32) -> Self {
        Self::new(max_attempts, Duration::ZERO, Duration::ZERO)
    }

    /// Run `operation` until it succeeds, fails terminally, or the attempt
    /// budget is spent.
    pub async fn call<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<T, RetryError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ExchangeError>>,
    {
        let mut backoff = ExponentialBackoff {
            current_interval: self.initial_interval,
            initial_interval: self.initial_interval,
            max_interval: self.max_interval,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };

        let mut attempt = 1u32;
        loop {
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() => {
                    if attempt >= self.max_attempts {
                        return Err(RetryError::Exhausted {
                            operation: operation.to_string(),
                            attempts: attempt,
                            source: err,
                        });
                    }
                    let delay = backoff.next_backoff().unwrap_or(self.max_interval);
                    warn!(
                        operation,
                        attempt,
                        max_attempts = self.max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "Temporary failure, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(RetryError::Aborted(err)),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn succeeds_after_transient_failures() {
        let policy = RetryPolicy::immediate(4);
        let calls = AtomicU32::new(0);

        let result = policy
            .call("fetch_ticker", || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(ExchangeError::Temporary("connection reset".into()))
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
    async fn exhausts_after_budget() {
        let policy = RetryPolicy::immediate(3);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .call("create_order", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ExchangeError::Temporary("rate limited".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result.unwrap_err() {
            RetryError::Exhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("expected exhaustion, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let policy = RetryPolicy::immediate(5);
        let calls = AtomicU32::new(0);

        let result: Result<(), _> = policy
            .call("create_order", || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(ExchangeError::Rejected("insufficient margin".into())) }
            })
            .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(
            result.unwrap_err(),
            RetryError::Aborted(ExchangeError::Rejected(_))
        ));
    }
}
