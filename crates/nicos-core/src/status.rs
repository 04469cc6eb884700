//! Device status codes and the worst-status reducer.
//!
//! A status is a `(code, message)` pair. Codes carry a total order so that
//! composite devices can summarize any number of attached devices with a
//! single "worst wins" reduction:
//!
//! ```text
//! Ok (200) < Warn (210) < Busy (220) < NotReached (230)
//!          < Disabled (235) < Error (240) < Unknown (999)
//! ```

use crate::capabilities::{MaxAge, Readable};
use crate::error::{NicosError, NicosResult};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Status code of a device, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusCode {
    /// Idle and at the requested value.
    Ok,
    /// Usable, but something deserves attention.
    Warn,
    /// Moving or otherwise working towards a target.
    Busy,
    /// Idle, but the requested target was not reached.
    NotReached,
    /// Switched off on purpose.
    Disabled,
    /// Hardware reports a fault.
    Error,
    /// Status cannot be determined.
    Unknown,
}

impl StatusCode {
    /// Numeric code as used by monitoring clients.
    pub fn code(&self) -> u16 {
        match self {
            Self::Ok => 200,
            Self::Warn => 210,
            Self::Busy => 220,
            Self::NotReached => 230,
            Self::Disabled => 235,
            Self::Error => 240,
            Self::Unknown => 999,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Warn => "warn",
            Self::Busy => "busy",
            Self::NotReached => "notreached",
            Self::Disabled => "disabled",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A status code together with a human readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub code: StatusCode,
    pub message: String,
}

impl DeviceStatus {
    pub fn new(code: StatusCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Ok, message)
    }

    pub fn idle() -> Self {
        Self::ok("idle")
    }

    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Warn, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Busy, message)
    }

    pub fn not_reached(message: impl Into<String>) -> Self {
        Self::new(StatusCode::NotReached, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Error, message)
    }

    pub fn unknown(message: impl Into<String>) -> Self {
        Self::new(StatusCode::Unknown, message)
    }

    pub fn is_ok(&self) -> bool {
        self.code == StatusCode::Ok
    }

    pub fn is_busy(&self) -> bool {
        self.code == StatusCode::Busy
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.code)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

/// Combine statuses, worst code wins, non-empty messages are joined.
///
/// An empty input has no meaningful status and yields `Unknown`.
///
/// ```rust
/// use nicos_core::status::{combine, DeviceStatus, StatusCode};
///
/// let st = combine([
///     DeviceStatus::ok(""),
///     DeviceStatus::warn("low flow"),
///     DeviceStatus::error("axis fault"),
/// ]);
/// assert_eq!(st.code, StatusCode::Error);
/// assert_eq!(st.message, "low flow, axis fault");
/// ```
pub fn combine<I>(statuses: I) -> DeviceStatus
where
    I: IntoIterator<Item = DeviceStatus>,
{
    let mut seen = false;
    let mut worst = StatusCode::Ok;
    let mut messages = Vec::new();
    for st in statuses {
        seen = true;
        worst = worst.max(st.code);
        if !st.message.is_empty() {
            messages.push(st.message);
        }
    }
    if !seen {
        return DeviceStatus::unknown("no status could be determined");
    }
    DeviceStatus::new(worst, messages.join(", "))
}

/// Same reduction as [`combine`], but messages are prefixed with the device
/// name (`name=message`, or `name=(message)` if the message contains `=`).
pub fn combine_named<I, S>(statuses: I) -> DeviceStatus
where
    I: IntoIterator<Item = (S, DeviceStatus)>,
    S: AsRef<str>,
{
    combine(statuses.into_iter().map(|(name, st)| {
        let message = if st.message.is_empty() {
            String::new()
        } else if st.message.contains('=') {
            format!("{}=({})", name.as_ref(), st.message)
        } else {
            format!("{}={}", name.as_ref(), st.message)
        };
        DeviceStatus::new(st.code, message)
    }))
}

/// Poll `device` until it leaves `Busy`, then return its value.
///
/// `Error` is reported as a move error and `NotReached` as a position error,
/// so callers that need blocking-move semantics get a typed failure instead
/// of having to inspect the status themselves.
pub async fn wait_for_status<D>(device: &D, delay: Duration) -> NicosResult<Value>
where
    D: Readable + ?Sized,
{
    let fresh: MaxAge = Some(Duration::ZERO);
    loop {
        let st = device.status(fresh).await?;
        match st.code {
            StatusCode::Busy => tokio::time::sleep(delay).await,
            StatusCode::Error => return Err(NicosError::moving(device.name(), st.message)),
            StatusCode::NotReached => {
                return Err(NicosError::position(device.name(), st.message))
            }
            _ => return device.read(fresh).await,
        }
    }
}
