//! # nicos-devices
//!
//! Composite and simulated devices built on the capability traits of
//! `nicos-core`:
//!
//! - [`switcher`]: named positions on top of one moveable ([`Switcher`]) or
//!   one readable ([`ReadonlySwitcher`])
//! - [`multi_switcher`]: named positions on top of several devices
//! - [`sequence`]: step-by-step execution with retries, and
//!   [`BaseSequencer`] to turn a step generator into a moveable
//! - [`locked`]: a device whose moves are bracketed by a lock
//! - [`virtual_motor`]: simulated axis with error injection
//! - [`bus`]: logical devices sharing one communication channel
//!
//! Composites hold their attached devices as `Arc<dyn Moveable>` or
//! `Arc<dyn Readable>`, so they stack: a switcher can drive a locked device
//! which moves a bus axis.

pub mod bus;
pub mod error_injection;
pub mod locked;
pub mod mapping;
pub mod multi_switcher;
pub mod sequence;
pub mod switcher;
pub mod virtual_motor;

pub use bus::{BusAxis, BusPoller, BusTransport, Reading, SharedBus, SimulatedBus};
pub use error_injection::{ErrorConfig, ErrorInjectionConfig, ErrorScenario};
pub use locked::{LockSequence, LockedDevice, LockedDeviceBuilder};
pub use mapping::{PositionEntry, PositionTable, Precision};
pub use multi_switcher::{MultiSwitcher, MultiSwitcherBuilder};
pub use sequence::{
    BaseSequencer, DefaultHooks, SeqCall, SeqDev, SeqFix, SeqNop, SeqSleep, SequenceExecutor,
    SequenceGenerator, SequenceHooks, SequenceItem, SequenceState, Step,
};
pub use switcher::{ReadonlySwitcher, Switcher, SwitcherBuilder};
pub use virtual_motor::{VirtualMotor, VirtualMotorBuilder};
