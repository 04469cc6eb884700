//! Bounded retry of transient failures.
//!
//! Used by the sequence executor for step items and by bus devices for
//! individual transactions. Only errors for which
//! [`NicosError::is_retryable`] holds are attempted again.

use crate::error::{NicosError, NicosResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;

/// Defines a policy for retrying an operation.
///
/// # Example
///
/// ```rust
/// use nicos_core::error_recovery::RetryPolicy;
/// use std::time::Duration;
///
/// let policy = RetryPolicy {
///     max_attempts: 5,
///     backoff_delay: Duration::from_millis(200),
/// };
/// assert!(policy.allows_attempt(5));
/// assert!(!policy.allows_attempt(6));
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    ///
    /// `1` disables retries. `0` is treated like `1`.
    pub max_attempts: u32,

    /// Constant delay between attempts.
    pub backoff_delay: Duration,
}

impl Default for RetryPolicy {
    /// Three attempts with 100ms between them.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff_delay: Duration::ZERO,
        }
    }

    /// Whether attempt number `attempt` (1-based) is still within budget.
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        attempt <= self.max_attempts.max(1)
    }
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy's attempt budget is used up. The last error is returned.
pub async fn retry_transient<T, F, Fut>(policy: &RetryPolicy, mut op: F) -> NicosResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = NicosResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(v) => return Ok(v),
            Err(err) if err.is_retryable() && policy.allows_attempt(attempt + 1) => {
                tracing::warn!(
                    device = err.device(),
                    attempt,
                    max_attempts = policy.max_attempts,
                    "transient failure, retrying: {}",
                    err
                );
                attempt += 1;
                sleep(policy.backoff_delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}
