//! Absolute and user limits of a continuous axis.

use crate::capabilities::Allowed;
use crate::error::{NicosError, NicosResult};
use serde::{Deserialize, Serialize};

/// Travel limits in user coordinates.
///
/// The absolute limits are the hard range of the hardware; the user limits
/// are an operator-adjustable window inside them. Targets are checked against
/// the user limits only, which are guaranteed to lie inside the absolute ones.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    abs: (f64, f64),
    user: (f64, f64),
}

impl Limits {
    /// Build limits, validating their consistency.
    ///
    /// Missing user limits default to the absolute limits.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if either range is inverted or the user
    /// range is not contained in the absolute range.
    pub fn new(device: &str, abs: (f64, f64), user: Option<(f64, f64)>) -> NicosResult<Self> {
        if abs.0 > abs.1 {
            return Err(NicosError::configuration(
                device,
                format!("absolute limits inverted: {} > {}", abs.0, abs.1),
            ));
        }
        let user = user.unwrap_or(abs);
        let limits = Self { abs, user };
        limits.validate_user(device, user)?;
        Ok(limits)
    }

    /// Unbounded limits, for devices without a travel range.
    pub fn unbounded() -> Self {
        Self {
            abs: (f64::NEG_INFINITY, f64::INFINITY),
            user: (f64::NEG_INFINITY, f64::INFINITY),
        }
    }

    pub fn abs(&self) -> (f64, f64) {
        self.abs
    }

    pub fn user(&self) -> (f64, f64) {
        self.user
    }

    fn validate_user(&self, device: &str, user: (f64, f64)) -> NicosResult<()> {
        if user.0 > user.1 {
            return Err(NicosError::configuration(
                device,
                format!("user limits inverted: {} > {}", user.0, user.1),
            ));
        }
        if user.0 < self.abs.0 || user.1 > self.abs.1 {
            return Err(NicosError::configuration(
                device,
                format!(
                    "user limits ({}, {}) outside absolute limits ({}, {})",
                    user.0, user.1, self.abs.0, self.abs.1
                ),
            ));
        }
        Ok(())
    }

    /// Replace the user limits.
    pub fn set_user(&mut self, device: &str, user: (f64, f64)) -> NicosResult<()> {
        self.validate_user(device, user)?;
        self.user = user;
        Ok(())
    }

    /// Shift both ranges by `-diff`, as happens when the offset grows by
    /// `diff` (`user = raw - offset`).
    pub fn shifted(&self, diff: f64) -> Self {
        Self {
            abs: (self.abs.0 - diff, self.abs.1 - diff),
            user: (self.user.0 - diff, self.user.1 - diff),
        }
    }

    /// Check a target in user coordinates.
    pub fn check(&self, value: f64) -> Allowed {
        if value.is_nan() {
            return Allowed::No("value is NaN".into());
        }
        if value < self.user.0 {
            return Allowed::No(format!("{} below user limit {}", value, self.user.0));
        }
        if value > self.user.1 {
            return Allowed::No(format!("{} above user limit {}", value, self.user.1));
        }
        Allowed::Yes
    }
}
