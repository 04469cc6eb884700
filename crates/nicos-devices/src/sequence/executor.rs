//! Background execution of a step list.
//!
//! # State machine
//!
//! ```text
//!          start()            all steps done
//! Idle ───────────▶ Running ─────────────────▶ Done
//!   ▲                 │  │   stop() honoured
//!   │ reset()         │  └───────────────────▶ Stopped
//!   │                 │      unrecovered failure
//!   └─────────────────┴──────────────────────▶ Failed
//! ```
//!
//! Any terminal state may be left with a new `start()`, except after a
//! failure that latched "needs manual fixing"; that condition is cleared
//! with `reset()` only.

use super::hooks::{DefaultHooks, FailureContext, Recovery, SequenceHooks};
use super::items::{SequenceItem, Step};
use futures::FutureExt;
use nicos_core::error::{NicosError, NicosResult};
use nicos_core::error_recovery::RetryPolicy;
use nicos_core::status::DeviceStatus;
use nicos_core::timing::SEQUENCE_POLL_INTERVAL;
use parking_lot::Mutex;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Lifecycle state of a [`SequenceExecutor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    Idle,
    Running,
    Done,
    Stopped,
    Failed,
}

impl SequenceState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Stopped | Self::Failed)
    }
}

/// Status visible to callers while the background task runs.
struct Mirror {
    status: DeviceStatus,
    step: Option<usize>,
    manual_fix: Option<String>,
    last_error: Option<NicosError>,
    current: Vec<Arc<dyn SequenceItem>>,
}

enum StepFailure {
    Abort(NicosError),
    ManualFix(NicosError),
}

enum Completion {
    Done,
    Stopped,
}

struct Inner {
    name: String,
    policy: RetryPolicy,
    hooks: Arc<dyn SequenceHooks>,
    state: watch::Sender<SequenceState>,
    mirror: Mutex<Mirror>,
    stop_requested: AtomicBool,
}

/// Runs a sequence of [`Step`]s in a background task.
///
/// Only one sequence runs at a time; starting a second one while the first
/// is running is refused with a move error. Cloning yields another handle to
/// the same executor.
///
/// # Example
///
/// ```rust,ignore
/// let executor = SequenceExecutor::builder("changer").build();
/// executor.start(vec![
///     SeqDev::new(lift.clone(), 10.0).into(),
///     SeqSleep::new(Duration::from_millis(100)).into(),
///     SeqDev::new(arm.clone(), 5.0).into(),
/// ]).await?;
/// executor.wait().await?;
/// ```
#[derive(Clone)]
pub struct SequenceExecutor {
    inner: Arc<Inner>,
}

impl SequenceExecutor {
    pub fn builder(name: impl Into<String>) -> SequenceExecutorBuilder {
        SequenceExecutorBuilder::new(name)
    }

    pub fn new(name: impl Into<String>) -> Self {
        Self::builder(name).build()
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.inner.policy
    }

    pub fn state(&self) -> SequenceState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn subscribe(&self) -> watch::Receiver<SequenceState> {
        self.inner.state.subscribe()
    }

    pub fn is_running(&self) -> bool {
        self.state() == SequenceState::Running
    }

    /// True whenever no sequence is running.
    pub fn is_completed(&self) -> bool {
        !self.is_running()
    }

    /// Index of the step being executed, if any.
    pub fn current_step(&self) -> Option<usize> {
        self.inner.mirror.lock().step
    }

    /// Reason of a latched "needs manual fixing" condition.
    pub fn manual_fix(&self) -> Option<String> {
        self.inner.mirror.lock().manual_fix.clone()
    }

    pub fn last_error(&self) -> Option<NicosError> {
        self.inner.mirror.lock().last_error.clone()
    }

    /// Current sequence status; a latched manual-fix condition wins.
    pub fn status(&self) -> DeviceStatus {
        let mirror = self.inner.mirror.lock();
        match &mirror.manual_fix {
            Some(reason) => DeviceStatus::error(format!("needs manual fixing: {}", reason)),
            None => mirror.status.clone(),
        }
    }

    /// Check all items and start the sequence in the background.
    pub async fn start(&self, steps: Vec<Step>) -> NicosResult<()> {
        let inner = &self.inner;
        if let Some(reason) = self.manual_fix() {
            return Err(NicosError::moving(
                &inner.name,
                format!("needs manual fixing ({}), reset first", reason),
            ));
        }
        if self.is_running() {
            return Err(NicosError::moving(&inner.name, "sequence is still running"));
        }

        for (i, step) in steps.iter().enumerate() {
            for item in step.items() {
                if let Err(err) = item.check().await {
                    tracing::error!(device = %inner.name, step = i + 1, "check of {} failed: {}", item, err);
                    inner.hooks.check_failed(i, &item.to_string(), err)?;
                }
            }
        }

        let mut claimed = false;
        inner.state.send_if_modified(|state| {
            if *state == SequenceState::Running {
                return false;
            }
            *state = SequenceState::Running;
            claimed = true;
            true
        });
        if !claimed {
            return Err(NicosError::moving(&inner.name, "sequence is still running"));
        }

        inner.stop_requested.store(false, Ordering::SeqCst);
        {
            let mut mirror = inner.mirror.lock();
            mirror.status = DeviceStatus::busy("starting sequence");
            mirror.last_error = None;
            mirror.step = None;
        }
        tracing::debug!(device = %inner.name, "starting sequence of {} steps", steps.len());
        for (i, step) in steps.iter().enumerate() {
            tracing::debug!(device = %inner.name, " - step {}: {}", i + 1, step);
        }

        let task = self.inner.clone();
        tokio::spawn(async move { task.run(steps).await });
        Ok(())
    }

    /// Request a cooperative stop.
    ///
    /// The current step finishes; interruptible items in it are cut short.
    /// No further step is started.
    pub async fn stop(&self) -> NicosResult<()> {
        if !self.is_running() {
            return Ok(());
        }
        self.inner.stop_requested.store(true, Ordering::SeqCst);
        tracing::debug!(device = %self.inner.name, "stop requested");
        let (step, current) = {
            let mirror = self.inner.mirror.lock();
            (mirror.step.unwrap_or(0), mirror.current.clone())
        };
        for item in current.iter().filter(|item| item.interruptible()) {
            if let Err(err) = item.stop().await {
                self.inner.hooks.stop_failed(step, &item.to_string(), err)?;
            }
        }
        Ok(())
    }

    /// Block until no sequence is running.
    ///
    /// A stopped sequence yields a `Stopped` error, a failed one the error
    /// that ended it.
    pub async fn wait(&self) -> NicosResult<()> {
        let mut rx = self.subscribe();
        let state = *rx
            .wait_for(|state| *state != SequenceState::Running)
            .await
            .map_err(|_| NicosError::moving(&self.inner.name, "sequence executor went away"))?;
        match state {
            SequenceState::Stopped => Err(NicosError::stopped(
                &self.inner.name,
                self.inner.mirror.lock().status.message.clone(),
            )),
            SequenceState::Failed => Err(self.last_error().unwrap_or_else(|| {
                NicosError::moving(&self.inner.name, "sequence failed")
            })),
            _ => Ok(()),
        }
    }

    /// Clear a finished or failed sequence, including "needs manual fixing".
    pub fn reset(&self) -> NicosResult<()> {
        let mut cleared = false;
        self.inner.state.send_if_modified(|state| {
            if *state == SequenceState::Running {
                return false;
            }
            cleared = true;
            let changed = *state != SequenceState::Idle;
            *state = SequenceState::Idle;
            changed
        });
        if !cleared {
            return Err(NicosError::moving(
                &self.inner.name,
                "cannot reset while a sequence is running",
            ));
        }
        let mut mirror = self.inner.mirror.lock();
        if let Some(reason) = mirror.manual_fix.take() {
            tracing::info!(device = %self.inner.name, "manual fixing condition cleared: {}", reason);
        }
        mirror.last_error = None;
        mirror.status = DeviceStatus::idle();
        Ok(())
    }
}

impl Inner {
    async fn run(self: Arc<Self>, steps: Vec<Step>) {
        let outcome = match AssertUnwindSafe(self.run_steps(&steps)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(payload) => {
                let err = NicosError::moving(
                    &self.name,
                    format!("sequence step panicked: {}", panic_message(payload.as_ref())),
                );
                Err(StepFailure::ManualFix(err))
            }
        };
        let terminal = {
            let mut mirror = self.mirror.lock();
            mirror.current.clear();
            mirror.step = None;
            match outcome {
                Ok(Completion::Done) => {
                    mirror.status = DeviceStatus::idle();
                    SequenceState::Done
                }
                Ok(Completion::Stopped) => SequenceState::Stopped,
                Err(StepFailure::Abort(err)) => {
                    mirror.status =
                        DeviceStatus::error(format!("error {} upon {}", err, mirror.status.message));
                    tracing::error!(device = %self.name, "{}", mirror.status.message);
                    mirror.last_error = Some(err);
                    SequenceState::Failed
                }
                Err(StepFailure::ManualFix(err)) => {
                    tracing::error!(device = %self.name, "needs manual fixing: {}", err);
                    mirror.status = DeviceStatus::error(format!("error {}", err));
                    mirror.manual_fix = Some(err.to_string());
                    mirror.last_error = Some(err);
                    SequenceState::Failed
                }
            }
        };
        match terminal {
            SequenceState::Done => tracing::debug!(device = %self.name, "sequence finished"),
            SequenceState::Stopped => tracing::info!(device = %self.name, "sequence stopped"),
            _ => {}
        }
        self.stop_requested.store(false, Ordering::SeqCst);
        self.state.send_replace(terminal);
    }

    fn set_status(&self, status: DeviceStatus) {
        tracing::debug!(device = %self.name, "{}", status.message);
        self.mirror.lock().status = status;
    }

    async fn run_steps(&self, steps: &[Step]) -> Result<Completion, StepFailure> {
        for (i, step) in steps.iter().enumerate() {
            {
                let mut mirror = self.mirror.lock();
                mirror.step = Some(i);
                mirror.current = step.items().to_vec();
            }
            self.set_status(DeviceStatus::busy(format!(
                "{}) starting actions: {}",
                i + 1,
                step
            )));

            let mut waiters = Vec::with_capacity(step.items().len());
            for item in step.items() {
                if self.run_item(i, item).await? {
                    waiters.push(item.clone());
                }
            }

            for (k, item) in waiters.iter().enumerate() {
                let pending = waiters[k..]
                    .iter()
                    .map(|item| item.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                self.set_status(DeviceStatus::busy(format!("waiting for: {}", pending)));
                self.wait_item(i, item).await?;
            }

            if self.stop_requested.load(Ordering::SeqCst) {
                for item in step.items() {
                    if let Err(err) = item.stop().await {
                        self.hooks
                            .stop_failed(i, &item.to_string(), err)
                            .map_err(StepFailure::Abort)?;
                    }
                }
                if let Err(err) = self.hooks.stop_action(i).await {
                    tracing::warn!(device = %self.name, "stop action failed: {}", err);
                }
                self.set_status(DeviceStatus::not_reached(format!(
                    "operation interrupted at step {}: {}",
                    i + 1,
                    step
                )));
                return Ok(Completion::Stopped);
            }
        }
        Ok(Completion::Done)
    }

    /// Run one item, retrying per the hooks. `Ok(false)` means the failure
    /// was ignored and the item must not be waited for.
    async fn run_item(
        &self,
        step: usize,
        item: &Arc<dyn SequenceItem>,
    ) -> Result<bool, StepFailure> {
        let mut attempt = 1;
        loop {
            let err = match item.run().await {
                Ok(()) => return Ok(true),
                Err(err) => err,
            };
            let desc = item.to_string();
            let ctx = FailureContext {
                step,
                item: &desc,
                error: &err,
                attempt,
            };
            match self.hooks.run_failed(&ctx, &self.policy) {
                Recovery::Abort => return Err(StepFailure::Abort(err)),
                Recovery::Retry(max_attempts) if attempt < max_attempts => {
                    tracing::warn!(
                        device = %self.name,
                        step = step + 1,
                        attempt,
                        max_attempts,
                        "{} failed, retrying: {}",
                        desc,
                        err
                    );
                    attempt += 1;
                    tokio::time::sleep(self.policy.backoff_delay).await;
                }
                Recovery::Retry(_) => {
                    self.escalate(&ctx)?;
                    return Ok(false);
                }
            }
        }
    }

    /// Wait for one item. A retry re-issues the item before waiting again.
    async fn wait_item(&self, step: usize, item: &Arc<dyn SequenceItem>) -> Result<(), StepFailure> {
        let mut attempt = 1;
        loop {
            let result = if attempt == 1 {
                poll_item(item.as_ref()).await
            } else {
                match item.run().await {
                    Ok(()) => poll_item(item.as_ref()).await,
                    Err(err) => Err(err),
                }
            };
            let err = match result {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };
            let desc = item.to_string();
            let ctx = FailureContext {
                step,
                item: &desc,
                error: &err,
                attempt,
            };
            match self.hooks.wait_failed(&ctx, &self.policy) {
                Recovery::Abort => return Err(StepFailure::Abort(err)),
                Recovery::Retry(max_attempts) if attempt < max_attempts => {
                    tracing::warn!(
                        device = %self.name,
                        step = step + 1,
                        attempt,
                        max_attempts,
                        "waiting for {} failed, retrying: {}",
                        desc,
                        err
                    );
                    attempt += 1;
                    tokio::time::sleep(self.policy.backoff_delay).await;
                }
                Recovery::Retry(_) => return self.escalate(&ctx),
            }
        }
    }

    fn escalate(&self, ctx: &FailureContext<'_>) -> Result<(), StepFailure> {
        match self.hooks.retry_failed(ctx) {
            Ok(()) => {
                tracing::warn!(
                    device = %self.name,
                    step = ctx.step + 1,
                    "ignoring failure of {} after {} attempts: {}",
                    ctx.item,
                    ctx.attempt,
                    ctx.error
                );
                Ok(())
            }
            Err(err) => {
                self.stop_requested.store(true, Ordering::SeqCst);
                Err(StepFailure::ManualFix(err))
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        msg
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg
    } else {
        "unknown panic"
    }
}

async fn poll_item(item: &dyn SequenceItem) -> NicosResult<()> {
    while !item.wait().await? {
        tokio::time::sleep(SEQUENCE_POLL_INTERVAL).await;
    }
    Ok(())
}

/// Builder for [`SequenceExecutor`].
pub struct SequenceExecutorBuilder {
    name: String,
    policy: RetryPolicy,
    hooks: Arc<dyn SequenceHooks>,
}

impl SequenceExecutorBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            policy: RetryPolicy::default(),
            hooks: Arc::new(DefaultHooks),
        }
    }

    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn hooks(mut self, hooks: Arc<dyn SequenceHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn build(self) -> SequenceExecutor {
        let (state, _) = watch::channel(SequenceState::Idle);
        SequenceExecutor {
            inner: Arc::new(Inner {
                name: self.name,
                policy: self.policy,
                hooks: self.hooks,
                state,
                mirror: Mutex::new(Mirror {
                    status: DeviceStatus::idle(),
                    step: None,
                    manual_fix: None,
                    last_error: None,
                    current: Vec::new(),
                }),
                stop_requested: AtomicBool::new(false),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sequence::items::{SeqCall, SeqNop, SeqSleep};
    use async_trait::async_trait;
    use std::fmt;
    use nicos_core::status::StatusCode;
    use std::sync::atomic::AtomicU32;
    use std::time::Duration;

    fn counting(label: &str, calls: Arc<AtomicU32>, fail_first: u32) -> SeqCall {
        SeqCall::new(label, move || {
            let calls = calls.clone();
            Box::pin(async move {
                let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
                if n <= fail_first {
                    Err(NicosError::communication("dev", format!("failure {}", n)))
                } else {
                    Ok(())
                }
            })
        })
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_delay: Duration::from_millis(1),
        }
    }

    #[tokio::test]
    async fn test_runs_to_done() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = SequenceExecutor::new("seq");
        executor
            .start(vec![
                counting("a", calls.clone(), 0).into(),
                SeqNop.into(),
                counting("b", calls.clone(), 0).into(),
            ])
            .await
            .unwrap();
        executor.wait().await.unwrap();
        assert_eq!(executor.state(), SequenceState::Done);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(executor.status(), DeviceStatus::idle());
        assert!(executor.is_completed());
    }

    #[tokio::test]
    async fn test_second_start_refused_while_running() {
        let executor = SequenceExecutor::new("seq");
        executor
            .start(vec![SeqSleep::new(Duration::from_millis(200)).into()])
            .await
            .unwrap();
        let err = executor.start(vec![SeqNop.into()]).await.unwrap_err();
        assert!(matches!(err, NicosError::Move { .. }));
        assert!(executor.status().is_busy());
        executor.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_retry_then_success() {
        let calls = Arc::new(AtomicU32::new(0));
        let executor = SequenceExecutor::builder("seq").policy(fast_policy(3)).build();
        executor
            .start(vec![counting("flaky", calls.clone(), 2).into()])
            .await
            .unwrap();
        executor.wait().await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_need_manual_fixing() {
        let calls = Arc::new(AtomicU32::new(0));
        let after = Arc::new(AtomicU32::new(0));
        let executor = SequenceExecutor::builder("seq").policy(fast_policy(2)).build();
        executor
            .start(vec![
                counting("flaky", calls.clone(), 5).into(),
                counting("after", after.clone(), 0).into(),
            ])
            .await
            .unwrap();
        let err = executor.wait().await.unwrap_err();
        assert!(matches!(err, NicosError::Communication { .. }));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(after.load(Ordering::SeqCst), 0);
        assert_eq!(executor.state(), SequenceState::Failed);

        let st = executor.status();
        assert_eq!(st.code, StatusCode::Error);
        assert!(st.message.starts_with("needs manual fixing"));
        assert!(executor.start(vec![SeqNop.into()]).await.is_err());

        executor.reset().unwrap();
        assert!(executor.manual_fix().is_none());
        executor.start(vec![SeqNop.into()]).await.unwrap();
        executor.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_non_retryable_aborts_without_manual_fix() {
        let executor = SequenceExecutor::new("seq");
        let item = SeqCall::new("bad", || {
            Box::pin(async { Err(NicosError::invalid_value("dev", "no such thing")) })
        });
        executor.start(vec![item.into()]).await.unwrap();
        let err = executor.wait().await.unwrap_err();
        assert!(matches!(err, NicosError::InvalidValue { .. }));
        assert!(executor.manual_fix().is_none());
        assert!(executor.status().message.starts_with("error "));
        // a plain failure does not block the next start
        executor.start(vec![SeqNop.into()]).await.unwrap();
        executor.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_stop_finishes_current_step_only() {
        let after = Arc::new(AtomicU32::new(0));
        let executor = SequenceExecutor::new("seq");
        executor
            .start(vec![
                SeqSleep::new(Duration::from_secs(60)).into(),
                counting("after", after.clone(), 0).into(),
            ])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        executor.stop().await.unwrap();
        let err = executor.wait().await.unwrap_err();
        assert!(matches!(err, NicosError::Stopped { .. }));
        assert_eq!(after.load(Ordering::SeqCst), 0);
        assert_eq!(executor.state(), SequenceState::Stopped);
        let st = executor.status();
        assert_eq!(st.code, StatusCode::NotReached);
        assert!(st.message.starts_with("operation interrupted at step 1"));
    }

    async fn crash() -> NicosResult<()> {
        panic!("motor driver crashed")
    }

    #[tokio::test]
    async fn test_panicking_step_latches_manual_fixing() {
        let after = Arc::new(AtomicU32::new(0));
        let executor = SequenceExecutor::new("seq");
        executor
            .start(vec![
                SeqCall::new("crash", || Box::pin(crash())).into(),
                counting("after", after.clone(), 0).into(),
            ])
            .await
            .unwrap();

        let result = tokio::time::timeout(Duration::from_secs(2), executor.wait())
            .await
            .expect("wait must return after a panicking step");
        assert!(matches!(result, Err(NicosError::Move { .. })));
        assert_eq!(executor.state(), SequenceState::Failed);
        assert_eq!(after.load(Ordering::SeqCst), 0);
        assert!(executor.manual_fix().unwrap().contains("motor driver crashed"));
        assert!(executor.status().message.starts_with("needs manual fixing"));
        assert!(executor.start(vec![SeqNop.into()]).await.is_err());

        executor.reset().unwrap();
        executor.start(vec![SeqNop.into()]).await.unwrap();
        executor.wait().await.unwrap();
    }

    /// Item with scripted failures and call counters.
    #[derive(Default)]
    struct Scripted {
        check_fails: bool,
        run_failures: AtomicU32,
        wait_failures: AtomicU32,
        stop_fails: bool,
        runs: AtomicU32,
        waits: AtomicU32,
    }

    impl fmt::Display for Scripted {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "scripted")
        }
    }

    #[async_trait]
    impl SequenceItem for Scripted {
        async fn check(&self) -> NicosResult<()> {
            if self.check_fails {
                return Err(NicosError::limit("dev", "outside limits"));
            }
            Ok(())
        }

        async fn run(&self) -> NicosResult<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if take_one(&self.run_failures) {
                return Err(NicosError::communication("dev", "garbled reply"));
            }
            Ok(())
        }

        async fn wait(&self) -> NicosResult<bool> {
            self.waits.fetch_add(1, Ordering::SeqCst);
            if take_one(&self.wait_failures) {
                return Err(NicosError::moving("dev", "motor stalled"));
            }
            Ok(true)
        }

        async fn stop(&self) -> NicosResult<()> {
            if self.stop_fails {
                return Err(NicosError::communication("dev", "stop not acknowledged"));
            }
            Ok(())
        }
    }

    fn take_one(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    /// Hooks whose decisions are configured per test and which record the
    /// stop callbacks they receive.
    #[derive(Default)]
    struct Custom {
        ignore_checks: bool,
        abort_runs: bool,
        ignore_exhausted: bool,
        wait_budget: Option<u32>,
        fail_on_stop_failure: bool,
        stop_actions: Mutex<Vec<usize>>,
        stop_failures: Mutex<Vec<(usize, String)>>,
    }

    #[async_trait]
    impl SequenceHooks for Custom {
        fn check_failed(&self, _step: usize, _item: &str, error: NicosError) -> NicosResult<()> {
            if self.ignore_checks {
                Ok(())
            } else {
                Err(error)
            }
        }

        fn run_failed(&self, ctx: &FailureContext<'_>, policy: &RetryPolicy) -> Recovery {
            if self.abort_runs {
                Recovery::Abort
            } else {
                DefaultHooks.run_failed(ctx, policy)
            }
        }

        fn wait_failed(&self, ctx: &FailureContext<'_>, policy: &RetryPolicy) -> Recovery {
            match self.wait_budget {
                Some(budget) => Recovery::Retry(budget),
                None => DefaultHooks.wait_failed(ctx, policy),
            }
        }

        fn retry_failed(&self, ctx: &FailureContext<'_>) -> NicosResult<()> {
            if self.ignore_exhausted {
                Ok(())
            } else {
                Err(ctx.error.clone())
            }
        }

        async fn stop_action(&self, step: usize) -> NicosResult<()> {
            self.stop_actions.lock().push(step);
            Ok(())
        }

        fn stop_failed(&self, step: usize, item: &str, error: NicosError) -> NicosResult<()> {
            self.stop_failures.lock().push((step, item.to_string()));
            if self.fail_on_stop_failure {
                Err(error)
            } else {
                Ok(())
            }
        }
    }

    fn with_hooks(hooks: Arc<Custom>, max_attempts: u32) -> SequenceExecutor {
        SequenceExecutor::builder("seq")
            .policy(fast_policy(max_attempts))
            .hooks(hooks)
            .build()
    }

    #[tokio::test]
    async fn test_ignored_check_failure_starts_anyway() {
        let steps = || -> Vec<Step> {
            vec![Scripted {
                check_fails: true,
                ..Default::default()
            }
            .into()]
        };
        let refusing = SequenceExecutor::new("seq");
        let err = refusing.start(steps()).await.unwrap_err();
        assert!(matches!(err, NicosError::Limit { .. }));
        assert_eq!(refusing.state(), SequenceState::Idle);

        let hooks = Arc::new(Custom {
            ignore_checks: true,
            ..Default::default()
        });
        let executor = with_hooks(hooks, 3);
        executor.start(steps()).await.unwrap();
        executor.wait().await.unwrap();
        assert_eq!(executor.state(), SequenceState::Done);
    }

    #[tokio::test]
    async fn test_aborting_run_hook_makes_retryable_error_fatal() {
        let item = Arc::new(Scripted {
            run_failures: AtomicU32::new(1),
            ..Default::default()
        });
        let hooks = Arc::new(Custom {
            abort_runs: true,
            ..Default::default()
        });
        let executor = with_hooks(hooks, 3);
        executor
            .start(vec![Step::parallel(vec![item.clone() as Arc<dyn SequenceItem>])])
            .await
            .unwrap();
        let err = executor.wait().await.unwrap_err();
        assert!(matches!(err, NicosError::Communication { .. }));
        assert_eq!(item.runs.load(Ordering::SeqCst), 1);
        assert_eq!(executor.state(), SequenceState::Failed);
        assert!(executor.manual_fix().is_none());
    }

    #[tokio::test]
    async fn test_ignored_exhausted_item_is_not_waited_for() {
        let item = Arc::new(Scripted {
            run_failures: AtomicU32::new(u32::MAX),
            ..Default::default()
        });
        let after = Arc::new(AtomicU32::new(0));
        let hooks = Arc::new(Custom {
            ignore_exhausted: true,
            ..Default::default()
        });
        let executor = with_hooks(hooks, 2);
        executor
            .start(vec![
                Step::parallel(vec![item.clone() as Arc<dyn SequenceItem>]),
                counting("after", after.clone(), 0).into(),
            ])
            .await
            .unwrap();
        executor.wait().await.unwrap();
        assert_eq!(executor.state(), SequenceState::Done);
        assert_eq!(item.runs.load(Ordering::SeqCst), 2);
        assert_eq!(item.waits.load(Ordering::SeqCst), 0);
        assert_eq!(after.load(Ordering::SeqCst), 1);
        assert!(executor.manual_fix().is_none());
    }

    #[tokio::test]
    async fn test_wait_budget_is_independent_of_run_budget() {
        let item = || {
            Arc::new(Scripted {
                run_failures: AtomicU32::new(1),
                wait_failures: AtomicU32::new(2),
                ..Default::default()
            })
        };

        // two attempts are enough for the run, not for the wait
        let tight = item();
        let executor = SequenceExecutor::builder("seq").policy(fast_policy(2)).build();
        executor
            .start(vec![Step::parallel(vec![tight.clone() as Arc<dyn SequenceItem>])])
            .await
            .unwrap();
        assert!(executor.wait().await.is_err());
        assert!(executor.manual_fix().is_some());

        let roomy = item();
        let hooks = Arc::new(Custom {
            wait_budget: Some(3),
            ..Default::default()
        });
        let executor = with_hooks(hooks, 2);
        executor
            .start(vec![Step::parallel(vec![roomy.clone() as Arc<dyn SequenceItem>])])
            .await
            .unwrap();
        executor.wait().await.unwrap();
        assert_eq!(executor.state(), SequenceState::Done);
        assert_eq!(roomy.waits.load(Ordering::SeqCst), 3);
        // one failed run, one good run, then one re-run per wait retry
        assert_eq!(roomy.runs.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_stop_action_receives_interrupted_step() {
        let after = Arc::new(AtomicU32::new(0));
        let hooks = Arc::new(Custom::default());
        let executor = with_hooks(hooks.clone(), 3);
        executor
            .start(vec![
                SeqNop.into(),
                SeqSleep::new(Duration::from_secs(60)).into(),
                counting("after", after.clone(), 0).into(),
            ])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        executor.stop().await.unwrap();
        assert!(matches!(
            executor.wait().await,
            Err(NicosError::Stopped { .. })
        ));
        assert_eq!(*hooks.stop_actions.lock(), vec![1]);
        assert_eq!(after.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_failed_item_stop_goes_through_hook() {
        let step = || {
            let items: Vec<Arc<dyn SequenceItem>> = vec![
                Arc::new(SeqSleep::new(Duration::from_secs(60))),
                Arc::new(Scripted {
                    stop_fails: true,
                    ..Default::default()
                }),
            ];
            Step::parallel(items)
        };

        let hooks = Arc::new(Custom::default());
        let executor = with_hooks(hooks.clone(), 3);
        executor.start(vec![step()]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        executor.stop().await.unwrap();
        assert!(matches!(
            executor.wait().await,
            Err(NicosError::Stopped { .. })
        ));
        assert_eq!(*hooks.stop_failures.lock(), vec![(0, "scripted".to_string())]);

        let hooks = Arc::new(Custom {
            fail_on_stop_failure: true,
            ..Default::default()
        });
        let executor = with_hooks(hooks, 3);
        executor.start(vec![step()]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        executor.stop().await.unwrap();
        assert!(matches!(
            executor.wait().await,
            Err(NicosError::Communication { .. })
        ));
        assert_eq!(executor.state(), SequenceState::Failed);
    }

    #[tokio::test]
    async fn test_reset_refused_while_running() {
        let executor = SequenceExecutor::new("seq");
        executor
            .start(vec![SeqSleep::new(Duration::from_millis(100)).into()])
            .await
            .unwrap();
        assert!(executor.reset().is_err());
        executor.wait().await.unwrap();
        executor.reset().unwrap();
        assert_eq!(executor.state(), SequenceState::Idle);
    }
}
