//! Atomic capability traits for devices.
//!
//! A device is described by the set of capabilities it implements rather than
//! by a deep class hierarchy:
//!
//! - [`Readable`]: has a value and a status
//! - [`Moveable`]: can be driven to a target
//! - [`CanReference`]: can run a reference (homing) drive
//! - [`Fixable`]: can be fixed by an operator so it refuses to move
//! - [`HasLimits`], [`HasOffset`], [`HasPrecision`], [`HasTimeout`]: optional
//!   behaviors layered on top of a moveable
//!
//! Composite devices (switchers, sequencers, locked devices) only depend on
//! these traits, never on a concrete driver, so they stack on each other and
//! on the virtual devices used in tests.
//!
//! All async traits use `async_trait` and require `Send + Sync`, so a device
//! can be shared as `Arc<dyn Moveable>` between the command path and a
//! background poller.

use crate::error::{NicosError, NicosResult};
use crate::limits::Limits;
use crate::status::{wait_for_status, DeviceStatus};
use crate::timeout::TimeoutTracker;
use crate::timing::POLL_INTERVAL;
use crate::value::Value;
use async_trait::async_trait;
use std::time::Duration;

/// Maximum acceptable age of a cached reading.
///
/// `None` lets the device answer from its cache; `Some(Duration::ZERO)`
/// forces a fresh hardware query.
pub type MaxAge = Option<Duration>;

/// Result of a pre-move permission check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allowed {
    Yes,
    /// Move refused, with the reason.
    No(String),
}

impl Allowed {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Allowed::Yes)
    }
}

/// Capability: a value and a status that can be read.
///
/// # Contract
///
/// - `read` returns the current value in user units
/// - `status` never fails for a reachable device; communication problems are
///   reported through `Err`, not through an `Unknown` status
#[async_trait]
pub trait Readable: Send + Sync {
    /// Unique device name within a setup.
    fn name(&self) -> &str;

    /// Read the current value.
    async fn read(&self, maxage: MaxAge) -> NicosResult<Value>;

    /// Read the current status.
    async fn status(&self, maxage: MaxAge) -> NicosResult<DeviceStatus>;

    /// Precision used when comparing readbacks against targets.
    ///
    /// Devices without a configured precision return `None`, which makes
    /// comparisons exact.
    fn precision(&self) -> Option<f64> {
        None
    }

    /// Clear a latched error condition and return the new status.
    async fn reset(&self) -> NicosResult<DeviceStatus> {
        self.status(Some(Duration::ZERO)).await
    }
}

/// Capability: can be driven to a target value.
///
/// `start` only initiates the motion; `wait` blocks until the device leaves
/// `Busy`. A composite that wants a blocking move calls both.
#[async_trait]
pub trait Moveable: Readable {
    /// Begin moving to `target`.
    async fn start(&self, target: Value) -> NicosResult<()>;

    /// Stop any motion in progress. Idempotent.
    async fn stop(&self) -> NicosResult<()> {
        Ok(())
    }

    /// Check whether `target` would be accepted, without moving.
    async fn is_allowed(&self, _target: &Value) -> Allowed {
        Allowed::Yes
    }

    /// Last requested target, if any.
    fn target(&self) -> Option<Value>;

    /// Block until the device is no longer busy and return the final value.
    async fn wait(&self) -> NicosResult<Value> {
        wait_for_status(self, POLL_INTERVAL).await
    }

    /// Start a move and wait for it to finish.
    async fn maw(&self, target: Value) -> NicosResult<Value> {
        self.start(target).await?;
        self.wait().await
    }
}

/// Capability: reference (homing) drive.
#[async_trait]
pub trait CanReference: Moveable {
    /// Run the reference drive and return the position afterwards.
    async fn reference(&self) -> NicosResult<Value>;
}

/// Capability: operator fix.
///
/// A fixed device refuses `start` with [`NicosError::Fixed`]. Fixing is
/// synchronous bookkeeping, not a hardware operation.
pub trait Fixable: Send + Sync {
    /// Fix the device. Returns `false` if it was already fixed.
    fn fix(&self, reason: &str) -> bool;

    /// Release a previous fix. Returns `false` if the device was not fixed.
    fn release(&self) -> bool;

    /// Reason of the current fix, if any.
    fn fixed_reason(&self) -> Option<String>;

    fn is_fixed(&self) -> bool {
        self.fixed_reason().is_some()
    }
}

/// Capability: absolute and user limits.
///
/// Implementors own a [`Limits`] value; the provided methods do the range
/// checking so that every device reports limit violations the same way.
pub trait HasLimits {
    fn limits(&self) -> Limits;

    /// Validate a numeric target against the user limits.
    fn check_limits(&self, name: &str, target: f64) -> NicosResult<()> {
        match self.limits().check(target) {
            Allowed::Yes => Ok(()),
            Allowed::No(reason) => Err(NicosError::limit(name, reason)),
        }
    }

    /// Same check, phrased as a permission answer for `is_allowed`.
    fn limits_allow(&self, target: &Value) -> Allowed {
        match target.as_f64() {
            Some(v) => self.limits().check(v),
            None => Allowed::No(format!("{} is not a numeric value", target)),
        }
    }
}

/// Capability: user offset between raw and user coordinates.
///
/// `user = raw - offset`. Changing the offset shifts the user limits along
/// with it, so the absolute travel range stays the same.
pub trait HasOffset {
    fn offset(&self) -> f64;

    /// Set a new offset, shifting user limits by the difference.
    fn set_offset(&self, offset: f64) -> NicosResult<()>;

    fn raw_to_user(&self, raw: f64) -> f64 {
        raw - self.offset()
    }

    fn user_to_raw(&self, user: f64) -> f64 {
        user + self.offset()
    }
}

/// Capability: precision window around the target.
pub trait HasPrecision {
    fn precision_window(&self) -> f64;

    /// Whether `position` lies within the precision window around `target`.
    /// Without a target every position counts as reached.
    fn is_at_target(&self, target: Option<f64>, position: f64) -> bool {
        match target {
            Some(t) => (t - position).abs() <= self.precision_window(),
            None => true,
        }
    }
}

/// Capability: moves must finish within a timeout.
///
/// While a timeout is armed and expired, the device status is raised to the
/// timeout status (by default `NotReached`) via
/// [`TimeoutTracker::combined_status`].
pub trait HasTimeout {
    fn timeout_tracker(&self) -> &TimeoutTracker;

    fn is_timed_out(&self) -> bool {
        self.timeout_tracker().is_timed_out()
    }

    /// Turn an expired timeout into an error for the given device.
    fn check_timeout(&self, name: &str) -> NicosResult<()> {
        if self.is_timed_out() {
            let tracker = self.timeout_tracker();
            return Err(NicosError::timeout(
                name,
                format!(
                    "target not reached within {}",
                    tracker
                        .timeout()
                        .map(|t| format!("{:?}", t))
                        .unwrap_or_else(|| "unlimited time".into())
                ),
            ));
        }
        Ok(())
    }
}
