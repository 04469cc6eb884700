//! # nicos-core
//!
//! Device abstraction layer: the value model, status codes and their
//! reduction, the error taxonomy and the capability traits that every device
//! and every composite device implements.
//!
//! Nothing in this crate talks to hardware. Drivers and composite devices
//! live in `nicos-devices`; they only see each other through the traits in
//! [`capabilities`].

pub mod capabilities;
pub mod error;
pub mod error_recovery;
pub mod limits;
pub mod status;
pub mod timeout;
pub mod timing;
pub mod value;

pub use capabilities::{
    Allowed, CanReference, Fixable, HasLimits, HasOffset, HasPrecision, HasTimeout, MaxAge,
    Moveable, Readable,
};
pub use error::{NicosError, NicosResult};
pub use error_recovery::RetryPolicy;
pub use limits::Limits;
pub use status::{combine, combine_named, DeviceStatus, StatusCode};
pub use timeout::TimeoutTracker;
pub use value::Value;
