//! Bounded retry for transient attempt failures

use crate::error::{Error, Result};
use std::future::Future;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// How often a failed attempt is rerun, and how long to wait between
/// runs. Only errors for which [`crate::Error::is_retryable`] holds
/// are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(1, Duration::from_secs(2))
    }
}

impl RetryPolicy {
    #[must_use]
    pub const fn new(max_retries: u32, backoff: Duration) -> Self {
        Self {
            max_retries,
            backoff,
        }
    }

    #[must_use]
    pub const fn none() -> Self {
        Self::new(0, Duration::ZERO)
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or
    /// the retry budget is spent. `op` receives the 1-based try number.
    ///
    /// Cancelling `cancel` ends the wait between tries at once; `op` is
    /// not called again and the result is [`Error::Cancelled`].
    ///
    /// Returns the final result and the number of tries used.
    pub async fn run<T, F, Fut>(&self, cancel: &CancellationToken, mut op: F) -> (Result<T>, u32)
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut tries = 0;
        loop {
            tries += 1;
            match op(tries).await {
                Err(e) if e.is_retryable() && tries <= self.max_retries => {
                    warn!(
                        "Try {}/{} failed with a transient error, retrying: {}",
                        tries,
                        self.max_retries + 1,
                        e
                    );
                    tokio::select! {
                        biased;
                        () = cancel.cancelled() => {
                            info!("Retry abandoned after {} tries: cancelled", tries);
                            return (Err(Error::Cancelled), tries);
                        }
                        () = tokio::time::sleep(self.backoff) => {}
                    }
                }
                result => return (result, tries),
            }
        }
    }
}
