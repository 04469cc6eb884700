//! Built-in sequence items.

use async_trait::async_trait;
use futures::future::BoxFuture;
use nicos_core::capabilities::{Allowed, Fixable, Moveable};
use nicos_core::error::{NicosError, NicosResult};
use nicos_core::status::StatusCode;
use nicos_core::value::Value;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;

/// One action of a sequence step.
///
/// The executor calls `check` on every item before the sequence starts, then
/// for each step `run` on all items of the step followed by `wait` on all of
/// them. `Display` is used for status messages and should read like the
/// equivalent operator command.
#[async_trait]
pub trait SequenceItem: fmt::Display + Send + Sync {
    /// Verify that the action can be performed, without side effects.
    async fn check(&self) -> NicosResult<()> {
        Ok(())
    }

    /// Initiate the action.
    async fn run(&self) -> NicosResult<()>;

    /// `Ok(true)` once the action completed; `Ok(false)` to be polled again.
    async fn wait(&self) -> NicosResult<bool> {
        Ok(true)
    }

    /// Interrupt the action started by `run`.
    async fn stop(&self) -> NicosResult<()> {
        Ok(())
    }

    /// Whether a stop request may cut this item short while it is waited for.
    fn interruptible(&self) -> bool {
        false
    }
}

/// Moves a device to a target and waits until it is there.
pub struct SeqDev {
    dev: Arc<dyn Moveable>,
    target: Value,
}

impl SeqDev {
    pub fn new(dev: Arc<dyn Moveable>, target: impl Into<Value>) -> Self {
        Self {
            dev,
            target: target.into(),
        }
    }
}

impl fmt::Display for SeqDev {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "maw({}, {})", self.dev.name(), self.target)
    }
}

#[async_trait]
impl SequenceItem for SeqDev {
    async fn check(&self) -> NicosResult<()> {
        match self.dev.is_allowed(&self.target).await {
            Allowed::Yes => Ok(()),
            Allowed::No(reason) => Err(NicosError::limit(self.dev.name(), reason)),
        }
    }

    async fn run(&self) -> NicosResult<()> {
        self.dev.start(self.target.clone()).await
    }

    async fn wait(&self) -> NicosResult<bool> {
        let st = self.dev.status(Some(Duration::ZERO)).await?;
        match st.code {
            StatusCode::Busy => Ok(false),
            StatusCode::Error => Err(NicosError::moving(self.dev.name(), st.message)),
            StatusCode::NotReached => Err(NicosError::position(self.dev.name(), st.message)),
            _ => Ok(true),
        }
    }

    async fn stop(&self) -> NicosResult<()> {
        self.dev.stop().await
    }
}

/// Action of a [`SeqCall`].
pub type CallFn = Box<dyn Fn() -> BoxFuture<'static, NicosResult<()>> + Send + Sync>;

/// Calls an async closure.
///
/// ```rust,ignore
/// let item = SeqCall::new("open_valve", move || {
///     let valve = valve.clone();
///     Box::pin(async move { valve.start(Value::from("open")).await })
/// });
/// ```
pub struct SeqCall {
    label: String,
    func: CallFn,
}

impl SeqCall {
    pub fn new<F>(label: impl Into<String>, func: F) -> Self
    where
        F: Fn() -> BoxFuture<'static, NicosResult<()>> + Send + Sync + 'static,
    {
        Self {
            label: label.into(),
            func: Box::new(func),
        }
    }
}

impl fmt::Display for SeqCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}()", self.label)
    }
}

#[async_trait]
impl SequenceItem for SeqCall {
    async fn run(&self) -> NicosResult<()> {
        (self.func)().await
    }
}

/// Waits for a fixed time. A stop request ends the wait early.
pub struct SeqSleep {
    duration: Duration,
    reason: Option<String>,
    deadline: Mutex<Option<Instant>>,
    stopped: AtomicBool,
    interrupt: Notify,
}

impl SeqSleep {
    pub fn new(duration: Duration) -> Self {
        Self {
            duration,
            reason: None,
            deadline: Mutex::new(None),
            stopped: AtomicBool::new(false),
            interrupt: Notify::new(),
        }
    }

    /// Text shown instead of the remaining time while sleeping.
    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

impl fmt::Display for SeqSleep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (*self.deadline.lock(), &self.reason) {
            (Some(_), Some(reason)) => write!(f, "{}", reason),
            (Some(deadline), None) => {
                let left = deadline.saturating_duration_since(Instant::now());
                write!(f, "waiting: {:.1}s", left.as_secs_f64())
            }
            (None, _) => write!(f, "wait({:?})", self.duration),
        }
    }
}

#[async_trait]
impl SequenceItem for SeqSleep {
    async fn run(&self) -> NicosResult<()> {
        self.stopped.store(false, Ordering::SeqCst);
        *self.deadline.lock() = Some(Instant::now() + self.duration);
        Ok(())
    }

    async fn wait(&self) -> NicosResult<bool> {
        let Some(deadline) = *self.deadline.lock() else {
            return Ok(true);
        };
        let notified = self.interrupt.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if !self.stopped.load(Ordering::SeqCst) {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => {}
                _ = notified => {}
            }
        }
        *self.deadline.lock() = None;
        Ok(true)
    }

    async fn stop(&self) -> NicosResult<()> {
        self.stopped.store(true, Ordering::SeqCst);
        self.interrupt.notify_waiters();
        Ok(())
    }

    fn interruptible(&self) -> bool {
        true
    }
}

/// What a [`SeqFix`] does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FixAction {
    Fix(String),
    Release,
}

/// Fixes or releases a device.
pub struct SeqFix {
    dev: Arc<dyn Fixable>,
    dev_name: String,
    action: FixAction,
}

impl SeqFix {
    pub fn fix(dev: Arc<dyn Fixable>, dev_name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            dev,
            dev_name: dev_name.into(),
            action: FixAction::Fix(reason.into()),
        }
    }

    pub fn release(dev: Arc<dyn Fixable>, dev_name: impl Into<String>) -> Self {
        Self {
            dev,
            dev_name: dev_name.into(),
            action: FixAction::Release,
        }
    }
}

impl fmt::Display for SeqFix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.action {
            FixAction::Fix(reason) => write!(f, "{}.fix('{}')", self.dev_name, reason),
            FixAction::Release => write!(f, "{}.release()", self.dev_name),
        }
    }
}

#[async_trait]
impl SequenceItem for SeqFix {
    async fn run(&self) -> NicosResult<()> {
        match &self.action {
            FixAction::Fix(reason) => {
                self.dev.fix(reason);
            }
            FixAction::Release => {
                self.dev.release();
            }
        }
        Ok(())
    }
}

/// Does nothing. Useful as a placeholder when hooks decide by step number.
pub struct SeqNop;

impl fmt::Display for SeqNop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NOP")
    }
}

#[async_trait]
impl SequenceItem for SeqNop {
    async fn run(&self) -> NicosResult<()> {
        Ok(())
    }
}

/// Items executed together: all are run, then all are waited for.
#[derive(Clone)]
pub struct Step {
    items: Vec<Arc<dyn SequenceItem>>,
}

impl Step {
    pub fn single(item: impl SequenceItem + 'static) -> Self {
        Self {
            items: vec![Arc::new(item)],
        }
    }

    pub fn parallel(items: Vec<Arc<dyn SequenceItem>>) -> Self {
        Self { items }
    }

    pub fn items(&self) -> &[Arc<dyn SequenceItem>] {
        &self.items
    }
}

impl<T: SequenceItem + 'static> From<T> for Step {
    fn from(item: T) -> Self {
        Step::single(item)
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", item)?;
        }
        Ok(())
    }
}
