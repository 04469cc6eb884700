//! Failure hooks of the sequence executor.

use async_trait::async_trait;
use nicos_core::error::{NicosError, NicosResult};
use nicos_core::error_recovery::RetryPolicy;

/// Where and how an item failed.
#[derive(Debug)]
pub struct FailureContext<'a> {
    /// Zero-based step index.
    pub step: usize,
    /// Display form of the failing item.
    pub item: &'a str,
    pub error: &'a NicosError,
    /// 1-based attempt that failed.
    pub attempt: u32,
}

/// Decision of a `run_failed` / `wait_failed` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Give up; the sequence ends in `Failed`.
    Abort,
    /// Allow up to this many attempts in total for the item.
    Retry(u32),
}

/// Customization points of a [`super::SequenceExecutor`].
///
/// The defaults retry transient errors per the executor's [`RetryPolicy`],
/// abort on everything else, and escalate an exhausted budget to the
/// "needs manual fixing" condition.
#[async_trait]
pub trait SequenceHooks: Send + Sync {
    /// An item's `check` failed before the sequence started.
    ///
    /// `Err` refuses the start; `Ok` ignores the failed check.
    fn check_failed(&self, step: usize, item: &str, error: NicosError) -> NicosResult<()> {
        let _ = (step, item);
        Err(error)
    }

    fn run_failed(&self, ctx: &FailureContext<'_>, policy: &RetryPolicy) -> Recovery {
        default_recovery(ctx, policy)
    }

    /// Same contract as `run_failed`, with a budget independent of it.
    fn wait_failed(&self, ctx: &FailureContext<'_>, policy: &RetryPolicy) -> Recovery {
        default_recovery(ctx, policy)
    }

    /// The retry budget of an item is used up.
    ///
    /// `Err` ends the sequence and latches the "needs manual fixing"
    /// condition; `Ok` ignores the failure and continues with the next item.
    fn retry_failed(&self, ctx: &FailureContext<'_>) -> NicosResult<()> {
        Err(ctx.error.clone())
    }

    /// Called after a stop request was honoured at the end of `step`.
    async fn stop_action(&self, step: usize) -> NicosResult<()> {
        let _ = step;
        Ok(())
    }

    /// Stopping an item of `step` failed.
    ///
    /// `Ok` carries on with the stop; `Err` ends the sequence with that error
    /// (or, from [`super::SequenceExecutor::stop`], is returned to the caller).
    fn stop_failed(&self, step: usize, item: &str, error: NicosError) -> NicosResult<()> {
        tracing::warn!(step = step + 1, "stopping {} failed: {}", item, error);
        Ok(())
    }
}

fn default_recovery(ctx: &FailureContext<'_>, policy: &RetryPolicy) -> Recovery {
    if ctx.error.is_retryable() {
        Recovery::Retry(policy.max_attempts.max(1))
    } else {
        Recovery::Abort
    }
}

/// Hooks with the default behavior.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultHooks;

impl SequenceHooks for DefaultHooks {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_recovery() {
        let policy = RetryPolicy::default();
        let transient = NicosError::communication("m", "timeout on wire");
        let ctx = FailureContext {
            step: 0,
            item: "maw(m, 1)",
            error: &transient,
            attempt: 1,
        };
        assert_eq!(DefaultHooks.run_failed(&ctx, &policy), Recovery::Retry(3));
        assert!(DefaultHooks.retry_failed(&ctx).is_err());

        let fatal = NicosError::limit("m", "above user limit");
        let ctx = FailureContext {
            error: &fatal,
            ..ctx
        };
        assert_eq!(DefaultHooks.wait_failed(&ctx, &policy), Recovery::Abort);
    }

    #[test]
    fn test_default_stop_failure_is_ignored() {
        let err = NicosError::communication("m", "no answer to stop");
        assert!(DefaultHooks.stop_failed(2, "maw(m, 1)", err).is_ok());
    }
}
