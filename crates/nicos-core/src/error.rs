//! Error taxonomy for device operations.
//!
//! Every failure a device can report is a [`NicosError`]. The variants follow
//! the kinds of failure an operator has to tell apart:
//!
//! - **`Configuration`**: malformed setup (table arity mismatch, missing
//!   attached device, limits outside the absolute range). Detected when the
//!   device is built; the device is unusable until the setup is fixed.
//! - **`InvalidValue`**: the caller asked for a value the device does not know
//!   (e.g. a position name that is not in the table). Rejected before any
//!   hardware is touched.
//! - **`Limit`**: the raw target lies outside the allowed range of an
//!   underlying device. No write is attempted.
//! - **`Position`**: the readback does not resolve to any known logical
//!   position, or a move ended without reaching its target.
//! - **`Move`** / **`Communication`** / **`Timeout`**: failures while hardware
//!   is being driven. These are the transient kinds the sequencer retries.
//! - **`Fixed`**: the device was fixed by an operator and refuses to move.
//! - **`Stopped`**: a sequence was interrupted by a stop request.
//!
//! Configuration, invalid-value and limit errors indicate a programmer or
//! operator mistake and are never retried; see [`NicosError::is_retryable`].

use thiserror::Error;

/// Convenience alias for results of device operations.
pub type NicosResult<T> = std::result::Result<T, NicosError>;

/// Primary error type for device operations.
///
/// All variants carry the name of the device that raised them, so an error
/// can travel through several layers of composite devices and still point at
/// the hardware that caused it.
///
/// # Example
///
/// ```rust
/// use nicos_core::error::NicosError;
///
/// let err = NicosError::invalid_value("mono", "unknown position 'Si'");
/// assert_eq!(err.to_string(), "mono: invalid value: unknown position 'Si'");
/// assert!(!err.is_retryable());
/// ```
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NicosError {
    /// Malformed device configuration, fatal at construction time.
    #[error("{device}: configuration error: {message}")]
    Configuration { device: String, message: String },

    /// Requested value is not acceptable for this device.
    #[error("{device}: invalid value: {message}")]
    InvalidValue { device: String, message: String },

    /// Requested raw target is outside the allowed range.
    #[error("{device}: limit error: {message}")]
    Limit { device: String, message: String },

    /// Readback does not correspond to a known or requested position.
    #[error("{device}: position error: {message}")]
    Position { device: String, message: String },

    /// Hardware failed while moving.
    #[error("{device}: move error: {message}")]
    Move { device: String, message: String },

    /// Communication with the hardware failed.
    #[error("{device}: communication error: {message}")]
    Communication { device: String, message: String },

    /// An operation did not complete in time.
    #[error("{device}: timeout: {message}")]
    Timeout { device: String, message: String },

    /// Device is fixed and refuses to move.
    #[error("{device}: device fixed: {message}")]
    Fixed { device: String, message: String },

    /// A running sequence was interrupted by a stop request.
    #[error("{device}: stopped: {message}")]
    Stopped { device: String, message: String },
}

impl NicosError {
    pub fn configuration(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Configuration {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn invalid_value(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidValue {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn limit(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Limit {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn position(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Position {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn moving(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Move {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn communication(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Communication {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn timeout(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Timeout {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn fixed(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fixed {
            device: device.into(),
            message: message.into(),
        }
    }

    pub fn stopped(device: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Stopped {
            device: device.into(),
            message: message.into(),
        }
    }

    /// Name of the device that raised the error.
    pub fn device(&self) -> &str {
        match self {
            Self::Configuration { device, .. }
            | Self::InvalidValue { device, .. }
            | Self::Limit { device, .. }
            | Self::Position { device, .. }
            | Self::Move { device, .. }
            | Self::Communication { device, .. }
            | Self::Timeout { device, .. }
            | Self::Fixed { device, .. }
            | Self::Stopped { device, .. } => device,
        }
    }

    /// Human readable message without the device prefix.
    pub fn message(&self) -> &str {
        match self {
            Self::Configuration { message, .. }
            | Self::InvalidValue { message, .. }
            | Self::Limit { message, .. }
            | Self::Position { message, .. }
            | Self::Move { message, .. }
            | Self::Communication { message, .. }
            | Self::Timeout { message, .. }
            | Self::Fixed { message, .. }
            | Self::Stopped { message, .. } => message,
        }
    }

    /// Whether a sequence step failing with this error may be attempted again.
    ///
    /// Only hardware-side failures qualify. Configuration, invalid-value and
    /// limit errors would fail identically on every attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Move { .. }
                | Self::Communication { .. }
                | Self::Timeout { .. }
                | Self::Position { .. }
        )
    }
}
