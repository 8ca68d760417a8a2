//! Retry policy for remote cache operations.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use super::CacheError;

/// Retries operations that fail with a retryable [`CacheError`].
///
/// Backoff doubles after each failed attempt up to `max_backoff`. A non-zero
/// backoff sleeps on the tokio timer, so it needs a tokio runtime with time
/// enabled; without a current runtime, [`execute`](Self::execute) fails with
/// [`CacheError::NoRuntime`] before the first attempt.
#[derive(Debug, Clone)]
pub struct Retrier {
    max_attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl Default for Retrier {
    fn default() -> Self {
        Self::new(3)
    }
}

impl Retrier {
    /// Up to `max_attempts` tries with no delay between them.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
        }
    }

    /// A retrier that tries once.
    pub fn none() -> Self {
        Self::new(1)
    }

    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Run `operation` until it succeeds, fails with a non-retryable error,
    /// or runs out of attempts. The attempt number, starting at 1, is passed
    /// to each call.
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, CacheError>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, CacheError>>,
    {
        let mut backoff = self.initial_backoff;
        if !backoff.is_zero()
            && self.max_attempts > 1
            && tokio::runtime::Handle::try_current().is_err()
        {
            return Err(CacheError::NoRuntime);
        }
        let mut attempt = 1;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) if error.is_retryable() && attempt < self.max_attempts => {
                    debug!(attempt, %error, "retrying remote cache operation");
                    if !backoff.is_zero() {
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(self.max_backoff);
                    }
                    attempt += 1;
                }
                Err(error) => return Err(error),
            }
        }
    }
}
