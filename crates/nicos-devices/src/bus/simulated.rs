//! In-memory multi-axis controller speaking the bus line protocol.
//!
//! Requests are `<addr><cmd>[<arg>]`:
//!
//! | request       | reply            | meaning                  |
//! |---------------|------------------|--------------------------|
//! | `<addr>ma<v>` | none             | move absolute to `v`     |
//! | `<addr>gp`    | `<addr>PO<v>`    | get position             |
//! | `<addr>gs`    | `<addr>GS<code>` | get state (0 idle, 1 moving, 2 fault) |
//! | `<addr>st`    | none             | stop                     |

use super::channel::BusTransport;
use async_trait::async_trait;
use nicos_core::error::{NicosError, NicosResult};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

pub const STATE_IDLE: u8 = 0;
pub const STATE_MOVING: u8 = 1;
pub const STATE_FAULT: u8 = 2;

#[derive(Debug, Clone)]
struct SimAxis {
    position: f64,
    motion: Option<Motion>,
    fault: bool,
}

#[derive(Debug, Clone, Copy)]
struct Motion {
    from: f64,
    to: f64,
    started: Instant,
}

impl SimAxis {
    /// Advance the axis to `now`, finishing the motion if it arrived.
    fn update(&mut self, speed: f64, now: Instant) {
        let Some(motion) = self.motion else {
            return;
        };
        let travelled = speed * now.duration_since(motion.started).as_secs_f64();
        let distance = motion.to - motion.from;
        if speed <= 0.0 || travelled >= distance.abs() {
            self.position = motion.to;
            self.motion = None;
        } else {
            self.position = motion.from + travelled.copysign(distance);
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    axes: BTreeMap<u8, SimAxis>,
    in_flight: bool,
    pending: Option<String>,
    overlaps: u32,
    transactions: u32,
    fail_next: u32,
}

/// Simulated controller.
///
/// Clones share the simulated hardware, like several cables plugged into the
/// same controller. Sending a request while another exchange is still in
/// flight is recorded as an overlap and answered with a communication error.
#[derive(Clone)]
pub struct SimulatedBus {
    state: Arc<Mutex<SimState>>,
    speed: f64,
    latency: Duration,
}

impl SimulatedBus {
    /// Axes at the given addresses, all starting at position 0.
    pub fn new(addresses: impl IntoIterator<Item = u8>) -> Self {
        let axes = addresses
            .into_iter()
            .map(|addr| {
                (
                    addr,
                    SimAxis {
                        position: 0.0,
                        motion: None,
                        fault: false,
                    },
                )
            })
            .collect();
        Self {
            state: Arc::new(Mutex::new(SimState {
                axes,
                ..SimState::default()
            })),
            speed: 0.0,
            latency: Duration::from_millis(1),
        }
    }

    /// Travel speed in units per second; 0 arrives instantly.
    pub fn with_speed(mut self, speed: f64) -> Self {
        self.speed = speed;
        self
    }

    /// Time one exchange occupies the wire.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Number of requests sent while another exchange was in flight.
    pub fn overlaps(&self) -> u32 {
        self.state.lock().overlaps
    }

    pub fn transactions(&self) -> u32 {
        self.state.lock().transactions
    }

    /// Fail the next `count` requests with communication errors.
    pub fn inject_failures(&self, count: u32) {
        self.state.lock().fail_next = count;
    }

    /// Latch a fault on an axis; it clears with the next move.
    pub fn set_fault(&self, addr: u8) {
        if let Some(axis) = self.state.lock().axes.get_mut(&addr) {
            axis.fault = true;
            axis.motion = None;
        }
    }

    pub fn position(&self, addr: u8) -> Option<f64> {
        let mut state = self.state.lock();
        let speed = self.speed;
        state.axes.get_mut(&addr).map(|axis| {
            axis.update(speed, Instant::now());
            axis.position
        })
    }

    fn handle(&self, state: &mut SimState, line: &str) -> NicosResult<Option<String>> {
        let digits = line.bytes().take_while(u8::is_ascii_digit).count();
        let (addr, rest) = line.split_at(digits);
        let addr: u8 = addr
            .parse()
            .map_err(|_| NicosError::communication("simulation", format!("no address in '{}'", line)))?;
        let axis = state
            .axes
            .get_mut(&addr)
            .ok_or_else(|| NicosError::communication("simulation", format!("no axis at address {}", addr)))?;
        let now = Instant::now();
        axis.update(self.speed, now);

        let cmd = rest.get(..2).unwrap_or(rest);
        let arg = rest.get(2..).unwrap_or("");
        match cmd {
            "ma" => {
                let to: f64 = arg.trim().parse().map_err(|_| {
                    NicosError::communication("simulation", format!("bad position '{}'", arg))
                })?;
                axis.fault = false;
                axis.motion = Some(Motion {
                    from: axis.position,
                    to,
                    started: now,
                });
                axis.update(self.speed, now);
                Ok(None)
            }
            "gp" => Ok(Some(format!("{}PO{}", addr, axis.position))),
            "gs" => {
                let code = if axis.fault {
                    STATE_FAULT
                } else if axis.motion.is_some() {
                    STATE_MOVING
                } else {
                    STATE_IDLE
                };
                Ok(Some(format!("{}GS{}", addr, code)))
            }
            "st" => {
                axis.motion = None;
                Ok(None)
            }
            _ => Err(NicosError::communication(
                "simulation",
                format!("unknown command '{}'", line),
            )),
        }
    }
}

#[async_trait]
impl BusTransport for SimulatedBus {
    async fn send(&mut self, line: &str) -> NicosResult<()> {
        let expects_reply = {
            let mut state = self.state.lock();
            if state.in_flight {
                state.overlaps += 1;
                return Err(NicosError::communication("simulation", "garbled: overlapping requests"));
            }
            state.transactions += 1;
            if state.fail_next > 0 {
                state.fail_next -= 1;
                return Err(NicosError::communication("simulation", "injected failure"));
            }
            let reply = self.handle(&mut state, line)?;
            state.in_flight = true;
            let expects_reply = reply.is_some();
            state.pending = reply;
            expects_reply
        };
        if !expects_reply {
            tokio::time::sleep(self.latency).await;
            self.state.lock().in_flight = false;
        }
        Ok(())
    }

    async fn receive(&mut self) -> NicosResult<String> {
        tokio::time::sleep(self.latency).await;
        let mut state = self.state.lock();
        state.in_flight = false;
        state
            .pending
            .take()
            .ok_or_else(|| NicosError::communication("simulation", "no reply pending"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_protocol() {
        let mut bus = SimulatedBus::new([1, 2]);
        bus.send("1ma2.5").await.unwrap();
        bus.send("1gp").await.unwrap();
        assert_eq!(bus.receive().await.unwrap(), "1PO2.5");
        bus.send("2gs").await.unwrap();
        assert_eq!(bus.receive().await.unwrap(), "2GS0");
        assert!(bus.send("9gp").await.is_err());
        assert!(bus.send("1xx").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_motion() {
        let mut bus = SimulatedBus::new([1]).with_speed(10.0);
        bus.send("1ma5").await.unwrap();
        bus.send("1gs").await.unwrap();
        assert_eq!(bus.receive().await.unwrap(), "1GS1");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(bus.position(1), Some(5.0));
    }

    #[tokio::test]
    async fn test_overlap_detected() {
        let mut a = SimulatedBus::new([1]).with_latency(Duration::from_millis(50));
        let mut b = a.clone();
        a.send("1gp").await.unwrap();
        // a's reply is still pending on the wire
        assert!(b.send("1gs").await.is_err());
        assert_eq!(b.overlaps(), 1);
        a.receive().await.unwrap();
    }
}
