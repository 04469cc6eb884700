//! Devices protected by a lock.
//!
//! Every move of the protected device is surrounded by moving the lock to
//! its unlock value before and back to the lock value afterwards. If the
//! protected device fails to move, the lock is left open: the sequence ends
//! there, and the operator has to restore a consistent state.

use crate::sequence::{BaseSequencer, SeqDev, SeqFix, SequenceExecutor, SequenceGenerator, Step};
use async_trait::async_trait;
use nicos_core::capabilities::{Allowed, Fixable, MaxAge, Moveable, Readable};
use nicos_core::error::{NicosError, NicosResult};
use nicos_core::error_recovery::RetryPolicy;
use nicos_core::status::{combine, DeviceStatus, StatusCode};
use nicos_core::value::Value;
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::Duration;

/// Sequence generator of a [`LockedDevice`].
pub struct LockSequence {
    name: String,
    device: Arc<dyn Moveable>,
    lock: Arc<dyn Moveable>,
    lock_fix: Option<Arc<dyn Fixable>>,
    unlock_value: Value,
    lock_value: RwLock<Option<Value>>,
    keep_fixed: bool,
}

impl LockSequence {
    pub fn device(&self) -> &Arc<dyn Moveable> {
        &self.device
    }

    pub fn lock(&self) -> &Arc<dyn Moveable> {
        &self.lock
    }

    pub fn unlock_value(&self) -> &Value {
        &self.unlock_value
    }

    pub fn lock_value(&self) -> Option<Value> {
        self.lock_value.read().clone()
    }

    fn fix_items(&self, fix: &Arc<dyn Fixable>) -> (SeqFix, SeqFix) {
        let lock_name = self.lock.name().to_string();
        (
            SeqFix::release(fix.clone(), lock_name.clone()),
            SeqFix::fix(
                fix.clone(),
                lock_name,
                format!("fixed unless {} moves", self.name),
            ),
        )
    }

    /// Where the lock goes after the move: the configured lock value, else
    /// the lock's last target, else its current readback.
    async fn final_lock_value(&self) -> NicosResult<Value> {
        if let Some(value) = self.lock_value() {
            return Ok(value);
        }
        if let Some(target) = self.lock.target() {
            return Ok(target);
        }
        self.lock.read(Some(Duration::ZERO)).await
    }

    async fn check_lock_value(&self, what: &str, value: &Value) -> NicosResult<()> {
        match self.lock.is_allowed(value).await {
            Allowed::Yes => Ok(()),
            Allowed::No(reason) => Err(NicosError::configuration(
                &self.name,
                format!("{} {} not allowed for {}: {}", what, value, self.lock.name(), reason),
            )),
        }
    }
}

#[async_trait]
impl SequenceGenerator for LockSequence {
    async fn generate(&self, target: &Value) -> NicosResult<Vec<Step>> {
        let final_value = self.final_lock_value().await?;
        self.check_lock_value("unlock value", &self.unlock_value).await?;
        self.check_lock_value("lock value", &final_value).await?;

        let fix = self.lock_fix.as_ref().filter(|_| self.keep_fixed);
        let mut steps: Vec<Step> = Vec::with_capacity(7);
        if let Some(fix) = fix {
            let (release, fix) = self.fix_items(fix);
            steps.push(release.into());
            steps.push(SeqDev::new(self.lock.clone(), self.unlock_value.clone()).into());
            steps.push(fix.into());
        } else {
            steps.push(SeqDev::new(self.lock.clone(), self.unlock_value.clone()).into());
        }
        steps.push(SeqDev::new(self.device.clone(), target.clone()).into());
        if let Some(fix) = fix {
            let (release, fix) = self.fix_items(fix);
            steps.push(release.into());
            steps.push(SeqDev::new(self.lock.clone(), final_value).into());
            steps.push(fix.into());
        } else {
            steps.push(SeqDev::new(self.lock.clone(), final_value).into());
        }
        Ok(steps)
    }

    async fn read(&self, maxage: MaxAge) -> NicosResult<Value> {
        self.device.read(maxage).await
    }

    async fn is_allowed(&self, target: &Value) -> Allowed {
        self.device.is_allowed(target).await
    }

    /// Worst of device, lock and sequence status.
    async fn status(&self, sequence: DeviceStatus, maxage: MaxAge) -> NicosResult<DeviceStatus> {
        if sequence.code == StatusCode::Error {
            return Ok(sequence);
        }
        let (device, lock) = futures::join!(self.device.status(maxage), self.lock.status(maxage));
        let (device, lock) = (device?, lock?);
        let worst = [device, lock, sequence]
            .into_iter()
            .max_by_key(|st| st.code)
            .unwrap_or_else(|| DeviceStatus::unknown("no status could be determined"));
        Ok(worst)
    }

    fn precision(&self) -> Option<f64> {
        self.device.precision()
    }
}

/// A device whose moves are surrounded by unlocking and relocking.
pub type LockedDevice = BaseSequencer<LockSequence>;

impl BaseSequencer<LockSequence> {
    pub fn builder(
        name: impl Into<String>,
        device: Arc<dyn Moveable>,
        lock: Arc<dyn Moveable>,
        unlock_value: impl Into<Value>,
    ) -> LockedDeviceBuilder {
        LockedDeviceBuilder {
            name: name.into(),
            device,
            lock,
            lock_fix: None,
            unlock_value: unlock_value.into(),
            lock_value: None,
            keep_fixed: false,
            policy: RetryPolicy::default(),
        }
    }

    /// Change the value the lock goes to after a move. Refused while moving.
    pub fn set_lock_value(&self, value: Option<Value>) -> NicosResult<()> {
        if self.executor().is_running() {
            return Err(NicosError::moving(
                self.name(),
                "cannot change the lock value while moving",
            ));
        }
        *self.generator().lock_value.write() = value;
        Ok(())
    }

    /// Status of the attached devices only, without the sequence status.
    pub async fn attached_status(&self, maxage: MaxAge) -> NicosResult<DeviceStatus> {
        let gen = self.generator();
        let (device, lock) = futures::join!(gen.device.status(maxage), gen.lock.status(maxage));
        Ok(combine([device?, lock?]))
    }
}

/// Builder for [`LockedDevice`].
pub struct LockedDeviceBuilder {
    name: String,
    device: Arc<dyn Moveable>,
    lock: Arc<dyn Moveable>,
    lock_fix: Option<Arc<dyn Fixable>>,
    unlock_value: Value,
    lock_value: Option<Value>,
    keep_fixed: bool,
    policy: RetryPolicy,
}

impl LockedDeviceBuilder {
    /// Value for the lock after a move; by default it returns to its
    /// previous target.
    pub fn lock_value(mut self, value: impl Into<Value>) -> Self {
        self.lock_value = Some(value.into());
        self
    }

    /// Keep the lock fixed while the device is not moving.
    pub fn keep_fixed(mut self, fix: Arc<dyn Fixable>) -> Self {
        self.lock_fix = Some(fix);
        self.keep_fixed = true;
        self
    }

    /// Retry budget for each step of the lock sequence.
    pub fn policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn build(self) -> NicosResult<LockedDevice> {
        if self.keep_fixed && self.lock_fix.is_none() {
            return Err(NicosError::configuration(
                &self.name,
                "keep_fixed needs a fixable lock",
            ));
        }
        let generator = LockSequence {
            name: self.name.clone(),
            device: self.device,
            lock: self.lock,
            lock_fix: self.lock_fix,
            unlock_value: self.unlock_value,
            lock_value: RwLock::new(self.lock_value),
            keep_fixed: self.keep_fixed,
        };
        let executor = SequenceExecutor::builder(self.name.clone())
            .policy(self.policy)
            .build();
        Ok(BaseSequencer::with_executor(self.name, generator, executor))
    }
}
