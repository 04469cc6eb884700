//! Moveables that reach their target through a generated sequence.

use super::executor::SequenceExecutor;
use super::items::Step;
use async_trait::async_trait;
use nicos_core::capabilities::{Allowed, MaxAge, Moveable, Readable};
use nicos_core::error::{NicosError, NicosResult};
use nicos_core::status::DeviceStatus;
use nicos_core::value::Value;
use parking_lot::Mutex;
use std::time::Duration;

/// Produces the steps that move a [`BaseSequencer`] to a target.
#[async_trait]
pub trait SequenceGenerator: Send + Sync {
    /// Steps for reaching `target`. Called once per `start`.
    async fn generate(&self, target: &Value) -> NicosResult<Vec<Step>>;

    /// Current value of the composite device.
    async fn read(&self, maxage: MaxAge) -> NicosResult<Value>;

    async fn is_allowed(&self, _target: &Value) -> Allowed {
        Allowed::Yes
    }

    /// Device status given the current sequence status.
    async fn status(&self, sequence: DeviceStatus, _maxage: MaxAge) -> NicosResult<DeviceStatus> {
        Ok(sequence)
    }

    fn precision(&self) -> Option<f64> {
        None
    }
}

/// Turns a [`SequenceGenerator`] into a [`Moveable`].
///
/// `start` generates a fresh step list and hands it to the executor; `wait`
/// blocks until the sequence ended and then reads the value.
pub struct BaseSequencer<G> {
    name: String,
    generator: G,
    executor: SequenceExecutor,
    target: Mutex<Option<Value>>,
}

impl<G: SequenceGenerator> BaseSequencer<G> {
    pub fn new(name: impl Into<String>, generator: G) -> Self {
        let name = name.into();
        let executor = SequenceExecutor::new(name.clone());
        Self::with_executor(name, generator, executor)
    }

    /// Use an executor with a custom retry policy or hooks.
    pub fn with_executor(name: impl Into<String>, generator: G, executor: SequenceExecutor) -> Self {
        Self {
            name: name.into(),
            generator,
            executor,
            target: Mutex::new(None),
        }
    }

    pub fn generator(&self) -> &G {
        &self.generator
    }

    pub fn executor(&self) -> &SequenceExecutor {
        &self.executor
    }
}

#[async_trait]
impl<G: SequenceGenerator> Readable for BaseSequencer<G> {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, maxage: MaxAge) -> NicosResult<Value> {
        self.generator.read(maxage).await
    }

    async fn status(&self, maxage: MaxAge) -> NicosResult<DeviceStatus> {
        self.generator.status(self.executor.status(), maxage).await
    }

    fn precision(&self) -> Option<f64> {
        self.generator.precision()
    }

    async fn reset(&self) -> NicosResult<DeviceStatus> {
        self.executor.reset()?;
        self.status(Some(Duration::ZERO)).await
    }
}

#[async_trait]
impl<G: SequenceGenerator> Moveable for BaseSequencer<G> {
    async fn start(&self, target: Value) -> NicosResult<()> {
        if self.executor.is_running() {
            return Err(NicosError::moving(
                &self.name,
                "cannot start device, it is still moving",
            ));
        }
        if let Allowed::No(reason) = self.generator.is_allowed(&target).await {
            return Err(NicosError::limit(&self.name, reason));
        }
        let steps = self.generator.generate(&target).await?;
        self.executor.start(steps).await?;
        *self.target.lock() = Some(target);
        Ok(())
    }

    async fn stop(&self) -> NicosResult<()> {
        self.executor.stop().await
    }

    async fn is_allowed(&self, target: &Value) -> Allowed {
        self.generator.is_allowed(target).await
    }

    fn target(&self) -> Option<Value> {
        self.target.lock().clone()
    }

    async fn wait(&self) -> NicosResult<Value> {
        self.executor.wait().await?;
        self.read(Some(Duration::ZERO)).await
    }
}
