//! One retry policy type for every class of remote call.
//!
//! Loads, mutations and draft writes each receive a [`RetryPolicy`]; the
//! difference between them lives in configuration, not in the hooks.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{ROW_NOT_FOUND_CODE, StoreError};

pub type BackoffFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;
pub type RetryPredicate = Arc<dyn Fn(&StoreError) -> bool + Send + Sync>;

/// Retry behavior: how many extra attempts, how long to wait before each,
/// and which errors qualify.
#[derive(Clone)]
pub struct RetryPolicy {
    pub retries: u32,
    backoff: BackoffFn,
    retry_on: RetryPredicate,
}

/// Errors that would fail the same way on every attempt are not retried.
pub fn default_retry_on(err: &StoreError) -> bool {
    !(err.is_missing_relation()
        || err.code == ROW_NOT_FOUND_CODE
        || err.code.starts_with("23")
        || err.code.starts_with("42"))
}

impl RetryPolicy {
    /// Single attempt.
    pub fn none() -> Self {
        Self {
            retries: 0,
            backoff: Arc::new(|_| Duration::ZERO),
            retry_on: Arc::new(default_retry_on),
        }
    }

    pub fn fixed(retries: u32, delay: Duration) -> Self {
        Self {
            retries,
            backoff: Arc::new(move |_| delay),
            retry_on: Arc::new(default_retry_on),
        }
    }

    /// `base * 2^(attempt-1)`, capped at `max`.
    pub fn exponential(retries: u32, base: Duration, max: Duration) -> Self {
        Self {
            retries,
            backoff: Arc::new(move |attempt| {
                let shift = attempt.saturating_sub(1).min(16);
                base.saturating_mul(1u32 << shift).min(max)
            }),
            retry_on: Arc::new(default_retry_on),
        }
    }

    pub fn with_backoff(mut self, backoff: impl Fn(u32) -> Duration + Send + Sync + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    pub fn with_retry_on(
        mut self,
        retry_on: impl Fn(&StoreError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.retry_on = Arc::new(retry_on);
        self
    }

    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        (self.backoff)(attempt)
    }

    /// Whether a failure after `attempts_made` attempts should be retried.
    pub fn should_retry(&self, attempts_made: u32, err: &StoreError) -> bool {
        attempts_made <= self.retries && (self.retry_on)(err)
    }

    /// Run `op` until it succeeds, the error is not retryable, or the
    /// retries are used up. Returns the last error.
    pub async fn run<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T, StoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, StoreError>>,
    {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            match op().await {
                Ok(value) => return Ok(value),
                Err(err) if self.should_retry(attempts, &err) => {
                    let delay = self.backoff(attempts);
                    tracing::warn!(
                        what,
                        attempt = attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "remote call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("retries", &self.retries)
            .field("first_backoff", &self.backoff(1))
            .finish_non_exhaustive()
    }
}
