//! Several logical devices on one physical communication channel.
//!
//! ```text
//! BusAxis(1) ─┐
//! BusAxis(2) ─┼──▶ SharedBus ──▶ BusTransport (serial line / SimulatedBus)
//! BusPoller  ─┘    (one request in flight)
//! ```

pub mod axis;
pub mod channel;
pub mod poller;
pub mod simulated;

pub use axis::BusAxis;
pub use channel::{BusTransport, SharedBus};
pub use poller::{BusPoller, Reading};
pub use simulated::SimulatedBus;
