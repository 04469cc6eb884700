//! Logical axis addressed on a shared bus.

use super::channel::SharedBus;
use super::simulated::{STATE_FAULT, STATE_IDLE, STATE_MOVING};
use async_trait::async_trait;
use nicos_core::capabilities::{Allowed, HasLimits, HasPrecision, MaxAge, Moveable, Readable};
use nicos_core::error::{NicosError, NicosResult};
use nicos_core::error_recovery::{retry_transient, RetryPolicy};
use nicos_core::limits::Limits;
use nicos_core::status::DeviceStatus;
use nicos_core::value::Value;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone)]
struct Cached<T> {
    value: T,
    at: Instant,
}

impl<T: Clone> Cached<T> {
    fn fresh_enough(slot: &Option<Cached<T>>, maxage: MaxAge) -> Option<T> {
        let cached = slot.as_ref()?;
        match maxage {
            None => Some(cached.value.clone()),
            Some(age) if cached.at.elapsed() <= age && !age.is_zero() => Some(cached.value.clone()),
            Some(_) => None,
        }
    }
}

/// An axis of a multi-axis controller reached through a [`SharedBus`].
///
/// Transient communication failures are retried per the axis'
/// [`RetryPolicy`]. Readings are cached, so a [`super::BusPoller`] keeps the
/// cache warm and `read(None)` answers without touching the wire.
pub struct BusAxis {
    name: String,
    address: u8,
    bus: SharedBus,
    policy: RetryPolicy,
    limits: Limits,
    precision: f64,
    target: Mutex<Option<f64>>,
    position: Mutex<Option<Cached<f64>>>,
    state: Mutex<Option<Cached<DeviceStatus>>>,
}

impl BusAxis {
    pub fn new(name: impl Into<String>, address: u8, bus: SharedBus) -> Self {
        Self {
            name: name.into(),
            address,
            bus,
            policy: RetryPolicy::default(),
            limits: Limits::unbounded(),
            precision: 0.0,
            target: Mutex::new(None),
            position: Mutex::new(None),
            state: Mutex::new(None),
        }
    }

    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    pub fn with_precision(mut self, precision: f64) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn address(&self) -> u8 {
        self.address
    }

    fn reply_payload<'a>(&self, reply: &'a str, tag: &str) -> NicosResult<&'a str> {
        let prefix = format!("{}{}", self.address, tag);
        reply.strip_prefix(prefix.as_str()).ok_or_else(|| {
            NicosError::communication(
                &self.name,
                format!("unexpected reply '{}', expected '{}...'", reply, prefix),
            )
        })
    }

    async fn query(&self, cmd: &str) -> NicosResult<String> {
        let request = format!("{}{}", self.address, cmd);
        retry_transient(&self.policy, |_| self.bus.query(&self.name, &request)).await
    }

    async fn command(&self, cmd: &str) -> NicosResult<()> {
        let request = format!("{}{}", self.address, cmd);
        retry_transient(&self.policy, |_| self.bus.command(&self.name, &request)).await
    }

    async fn read_position(&self) -> NicosResult<f64> {
        let reply = self.query("gp").await?;
        let position = self
            .reply_payload(&reply, "PO")?
            .trim()
            .parse::<f64>()
            .map_err(|_| NicosError::communication(&self.name, format!("bad position reply '{}'", reply)))?;
        *self.position.lock() = Some(Cached {
            value: position,
            at: Instant::now(),
        });
        Ok(position)
    }

    async fn read_state(&self) -> NicosResult<DeviceStatus> {
        let reply = self.query("gs").await?;
        let code = self.reply_payload(&reply, "GS")?.trim().parse::<u8>().ok();
        let status = match code {
            Some(STATE_IDLE) => DeviceStatus::idle(),
            Some(STATE_MOVING) => DeviceStatus::busy("moving"),
            Some(STATE_FAULT) => DeviceStatus::error("axis fault"),
            _ => DeviceStatus::unknown(format!("unknown state reply '{}'", reply)),
        };
        *self.state.lock() = Some(Cached {
            value: status.clone(),
            at: Instant::now(),
        });
        Ok(status)
    }
}

#[async_trait]
impl Readable for BusAxis {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, maxage: MaxAge) -> NicosResult<Value> {
        let cached = Cached::fresh_enough(&self.position.lock(), maxage);
        let position = match cached {
            Some(position) => position,
            None => self.read_position().await?,
        };
        Ok(Value::Float(position))
    }

    async fn status(&self, maxage: MaxAge) -> NicosResult<DeviceStatus> {
        let cached = Cached::fresh_enough(&self.state.lock(), maxage);
        let status = match cached {
            Some(status) => status,
            None => self.read_state().await?,
        };
        if !status.is_ok() {
            return Ok(status);
        }
        let target = *self.target.lock();
        let cached = Cached::fresh_enough(&self.position.lock(), maxage);
        let position = match cached {
            Some(position) => position,
            None => self.read_position().await?,
        };
        if !self.is_at_target(target, position) {
            return Ok(DeviceStatus::not_reached(format!(
                "at {}, target {}",
                position,
                target.unwrap_or(position)
            )));
        }
        Ok(status)
    }

    fn precision(&self) -> Option<f64> {
        (self.precision > 0.0).then_some(self.precision)
    }
}

#[async_trait]
impl Moveable for BusAxis {
    async fn start(&self, target: Value) -> NicosResult<()> {
        let position = target.as_f64().ok_or_else(|| {
            NicosError::invalid_value(&self.name, format!("{} is not a number", target))
        })?;
        self.check_limits(&self.name, position)?;
        self.command(&format!("ma{}", position)).await?;
        *self.target.lock() = Some(position);
        *self.state.lock() = None;
        tracing::debug!(device = %self.name, "moving to {}", position);
        Ok(())
    }

    async fn stop(&self) -> NicosResult<()> {
        self.command("st").await?;
        *self.state.lock() = None;
        let position = self.read_position().await?;
        *self.target.lock() = Some(position);
        Ok(())
    }

    async fn is_allowed(&self, target: &Value) -> Allowed {
        self.limits_allow(target)
    }

    fn target(&self) -> Option<Value> {
        self.target.lock().map(Value::Float)
    }
}

impl HasLimits for BusAxis {
    fn limits(&self) -> Limits {
        self.limits
    }
}

impl HasPrecision for BusAxis {
    fn precision_window(&self) -> f64 {
        self.precision.max(1e-9)
    }
}
