//! Bounded retry with per-attempt timeout for store RPCs.

use crate::error::{SyncError, SyncResult};
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Retry policy for reference resolution and derived-state writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Time allowed for one attempt.
    pub timeout: Duration,
    /// Attempts before giving up (at least one is always made).
    pub max_attempts: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2000),
            max_attempts: 3,
            backoff: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy.
    pub fn new(timeout: Duration, max_attempts: u32, backoff: Duration) -> Self {
        Self {
            timeout,
            max_attempts,
            backoff,
        }
    }

    /// A single attempt with the given timeout.
    pub fn once(timeout: Duration) -> Self {
        Self::new(timeout, 1, Duration::ZERO)
    }

    /// Runs `op` until it succeeds, fails with a non-transient error, or
    /// runs out of attempts.
    ///
    /// An attempt exceeding `timeout` counts as a [`SyncError::Timeout`].
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> SyncResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SyncResult<T>>,
    {
        let attempts = self.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(SyncError::timeout(
                    operation,
                    u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
                )),
            };

            match result {
                Err(e) if e.is_transient() && attempt < attempts => {
                    debug!(operation, attempt, error = %e, "Retrying after transient failure");
                    attempt += 1;
                    if !self.backoff.is_zero() {
                        tokio::time::sleep(self.backoff).await;
                    }
                }
                other => return other,
            }
        }
    }
}
