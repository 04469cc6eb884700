//! Simulated continuous axis.

use crate::error_injection::ErrorConfig;
use async_trait::async_trait;
use nicos_core::capabilities::{
    Allowed, CanReference, Fixable, HasLimits, HasOffset, HasPrecision, HasTimeout, MaxAge,
    Moveable, Readable,
};
use nicos_core::error::{NicosError, NicosResult};
use nicos_core::limits::Limits;
use nicos_core::status::DeviceStatus;
use nicos_core::timeout::TimeoutTracker;
use nicos_core::timing::MOTION_TICK;
use nicos_core::value::Value;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug)]
struct MotorState {
    /// Position in raw (hardware) coordinates.
    raw: f64,
    /// Requested position in raw coordinates.
    target: Option<f64>,
    moving: bool,
    fault: Option<String>,
    offset: f64,
    limits: Limits,
    fixed: Option<String>,
    /// Bumped on every start/stop so a superseded motion task exits.
    generation: u64,
}

/// Virtual motor with timed motion.
///
/// Simulates a continuous axis with:
/// - user offset and absolute/user limits
/// - motion at a fixed speed in a background task (speed 0 is instantaneous)
/// - precision window and move timeout
/// - reference drive and operator fix
/// - error injection for testing
///
/// # Example
///
/// ```rust,ignore
/// let motor = VirtualMotor::builder("m1")
///     .limits(-100.0, 100.0)
///     .speed(20.0)
///     .build()?;
///
/// motor.maw(Value::Float(10.0)).await?;
/// ```
pub struct VirtualMotor {
    name: String,
    state: Arc<Mutex<MotorState>>,
    speed: f64,
    precision: f64,
    reference_position: f64,
    unit: String,
    error_config: ErrorConfig,
    timeout: TimeoutTracker,
    starts: AtomicU32,
}

impl VirtualMotor {
    pub fn builder(name: impl Into<String>) -> VirtualMotorBuilder {
        VirtualMotorBuilder::new(name)
    }

    /// Number of `start` calls issued so far, failed ones included.
    pub fn start_count(&self) -> u32 {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn unit(&self) -> &str {
        &self.unit
    }

    pub fn is_moving(&self) -> bool {
        self.state.lock().moving
    }

    /// Replace the user limits; they must lie inside the absolute limits.
    pub fn set_user_limits(&self, min: f64, max: f64) -> NicosResult<()> {
        self.state.lock().limits.set_user(&self.name, (min, max))
    }

    fn spawn_motion(&self, generation: u64, raw_target: f64, fault: bool, stuck: bool) {
        let state = self.state.clone();
        let step = self.speed * MOTION_TICK.as_secs_f64();
        let name = self.name.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MOTION_TICK);
            interval.tick().await;
            loop {
                interval.tick().await;
                let mut st = state.lock();
                if st.generation != generation || !st.moving {
                    return;
                }
                if stuck {
                    continue;
                }
                let remaining = raw_target - st.raw;
                if remaining.abs() <= step {
                    st.raw = raw_target;
                    st.moving = false;
                    tracing::debug!(device = %name, "reached {}", raw_target - st.offset);
                    return;
                }
                st.raw += step.copysign(remaining);
                if fault {
                    st.moving = false;
                    st.fault = Some("injected motion fault".into());
                    tracing::debug!(device = %name, "motion fault at {}", st.raw - st.offset);
                    return;
                }
            }
        });
    }
}

#[async_trait]
impl Readable for VirtualMotor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn read(&self, _maxage: MaxAge) -> NicosResult<Value> {
        let st = self.state.lock();
        Ok(Value::Float(st.raw - st.offset))
    }

    async fn status(&self, _maxage: MaxAge) -> NicosResult<DeviceStatus> {
        let (hw, at_target) = {
            let st = self.state.lock();
            let hw = if let Some(fault) = &st.fault {
                DeviceStatus::error(fault.clone())
            } else if st.moving {
                let target = st.target.map(|t| t - st.offset).unwrap_or(st.raw);
                DeviceStatus::busy(format!("moving to {}", target))
            } else {
                DeviceStatus::idle()
            };
            (hw, self.is_at_target(st.target, st.raw))
        };
        Ok(self.timeout.combined_status(hw, at_target))
    }

    fn precision(&self) -> Option<f64> {
        (self.precision > 0.0).then_some(self.precision)
    }

    async fn reset(&self) -> NicosResult<DeviceStatus> {
        {
            let mut st = self.state.lock();
            st.fault = None;
        }
        self.timeout.clear();
        self.status(Some(Duration::ZERO)).await
    }
}

#[async_trait]
impl Moveable for VirtualMotor {
    async fn start(&self, target: Value) -> NicosResult<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let user_target = target.as_f64().ok_or_else(|| {
            NicosError::invalid_value(&self.name, format!("{} is not a number", target))
        })?;
        if let Some(reason) = self.fixed_reason() {
            return Err(NicosError::fixed(&self.name, reason));
        }
        self.check_limits(&self.name, user_target)?;
        self.error_config.check_start(&self.name)?;

        let fault = self.error_config.take_motion_fault();
        let stuck = self.error_config.is_stuck();
        let (generation, raw_target, ramp) = {
            let mut st = self.state.lock();
            let raw_target = user_target + st.offset;
            st.generation += 1;
            st.target = Some(raw_target);
            st.fault = None;
            let distance = (raw_target - st.raw).abs();
            let instant = self.speed <= 0.0 && !stuck;
            let ramp = if self.speed > 0.0 {
                Duration::try_from_secs_f64(distance / self.speed).unwrap_or(Duration::MAX)
            } else {
                Duration::ZERO
            };
            if instant {
                if fault {
                    st.fault = Some("injected motion fault".into());
                } else {
                    st.raw = raw_target;
                }
                st.moving = false;
            } else {
                st.moving = true;
            }
            (st.generation, raw_target, ramp)
        };
        self.timeout.begin(ramp);
        tracing::debug!(device = %self.name, "moving to {}", user_target);
        if self.speed > 0.0 || stuck {
            self.spawn_motion(generation, raw_target, fault, stuck);
        }
        Ok(())
    }

    async fn stop(&self) -> NicosResult<()> {
        let mut st = self.state.lock();
        if st.moving {
            tracing::debug!(device = %self.name, "stopped at {}", st.raw - st.offset);
            st.target = Some(st.raw);
        }
        st.moving = false;
        st.generation += 1;
        self.timeout.clear();
        Ok(())
    }

    async fn is_allowed(&self, target: &Value) -> Allowed {
        self.limits_allow(target)
    }

    fn target(&self) -> Option<Value> {
        let st = self.state.lock();
        st.target.map(|t| Value::Float(t - st.offset))
    }
}

#[async_trait]
impl CanReference for VirtualMotor {
    async fn reference(&self) -> NicosResult<Value> {
        if let Some(reason) = self.fixed_reason() {
            return Err(NicosError::fixed(&self.name, reason));
        }
        {
            let mut st = self.state.lock();
            st.generation += 1;
            st.moving = false;
            st.fault = None;
            st.raw = self.reference_position;
            st.target = None;
        }
        self.timeout.clear();
        tracing::info!(device = %self.name, "reference drive finished");
        self.read(Some(Duration::ZERO)).await
    }
}

impl Fixable for VirtualMotor {
    fn fix(&self, reason: &str) -> bool {
        let mut st = self.state.lock();
        if st.fixed.is_some() {
            return false;
        }
        st.fixed = Some(if reason.is_empty() {
            "fixed".to_string()
        } else {
            reason.to_string()
        });
        true
    }

    fn release(&self) -> bool {
        self.state.lock().fixed.take().is_some()
    }

    fn fixed_reason(&self) -> Option<String> {
        self.state.lock().fixed.clone()
    }
}

impl HasLimits for VirtualMotor {
    fn limits(&self) -> Limits {
        self.state.lock().limits
    }
}

impl HasOffset for VirtualMotor {
    fn offset(&self) -> f64 {
        self.state.lock().offset
    }

    fn set_offset(&self, offset: f64) -> NicosResult<()> {
        let mut st = self.state.lock();
        let diff = offset - st.offset;
        st.limits = st.limits.shifted(diff);
        st.offset = offset;
        tracing::info!(device = %self.name, "offset set to {}", offset);
        Ok(())
    }
}

impl HasPrecision for VirtualMotor {
    fn precision_window(&self) -> f64 {
        self.precision.max(1e-9)
    }
}

impl HasTimeout for VirtualMotor {
    fn timeout_tracker(&self) -> &TimeoutTracker {
        &self.timeout
    }
}

/// Builder for [`VirtualMotor`].
pub struct VirtualMotorBuilder {
    name: String,
    position: f64,
    speed: f64,
    precision: f64,
    abs_limits: (f64, f64),
    user_limits: Option<(f64, f64)>,
    offset: f64,
    timeout: Option<Duration>,
    reference_position: f64,
    unit: String,
    error_config: ErrorConfig,
}

impl VirtualMotorBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            position: 0.0,
            speed: 0.0,
            precision: 0.0,
            abs_limits: (f64::NEG_INFINITY, f64::INFINITY),
            user_limits: None,
            offset: 0.0,
            timeout: None,
            reference_position: 0.0,
            unit: String::new(),
            error_config: ErrorConfig::none(),
        }
    }

    /// Initial position in user coordinates.
    pub fn position(mut self, position: f64) -> Self {
        self.position = position;
        self
    }

    /// Speed in units per second; 0 moves instantaneously.
    pub fn speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    pub fn precision(mut self, precision: f64) -> Self {
        self.precision = precision;
        self
    }

    pub fn limits(mut self, min: f64, max: f64) -> Self {
        self.abs_limits = (min, max);
        self
    }

    pub fn user_limits(mut self, min: f64, max: f64) -> Self {
        self.user_limits = Some((min, max));
        self
    }

    pub fn offset(mut self, offset: f64) -> Self {
        self.offset = offset;
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Raw position the reference drive ends at.
    pub fn reference_position(mut self, position: f64) -> Self {
        self.reference_position = position;
        self
    }

    pub fn unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = unit.into();
        self
    }

    pub fn error_config(mut self, config: ErrorConfig) -> Self {
        self.error_config = config;
        self
    }

    /// Build the motor, validating limits and speed.
    pub fn build(self) -> NicosResult<VirtualMotor> {
        if self.speed < 0.0 || self.speed.is_nan() {
            return Err(NicosError::configuration(
                &self.name,
                "speed must not be negative",
            ));
        }
        let limits = Limits::new(&self.name, self.abs_limits, self.user_limits)?;
        Ok(VirtualMotor {
            state: Arc::new(Mutex::new(MotorState {
                raw: self.position + self.offset,
                target: None,
                moving: false,
                fault: None,
                offset: self.offset,
                limits,
                fixed: None,
                generation: 0,
            })),
            name: self.name,
            speed: self.speed,
            precision: self.precision,
            reference_position: self.reference_position,
            unit: self.unit,
            error_config: self.error_config,
            timeout: TimeoutTracker::new(self.timeout),
            starts: AtomicU32::new(0),
        })
    }
}
