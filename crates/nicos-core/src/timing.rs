//! Poll intervals shared by devices and the sequencer.
//!
//! Hardware here is polled, not interrupt driven; these constants match the
//! poll rates of typical lab instrument controllers.

use std::time::Duration;

/// Delay between status inquiries while waiting for a device to leave BUSY.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Delay between polls of the step items of a running sequence.
pub const SEQUENCE_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Update period of simulated motion.
pub const MOTION_TICK: Duration = Duration::from_millis(20);

/// Maximum time a logical device waits to get hold of a shared channel.
pub const CHANNEL_LOCK_TIMEOUT: Duration = Duration::from_secs(5);
