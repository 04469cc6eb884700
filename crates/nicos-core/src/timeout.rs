//! Lazy move-timeout evaluation.
//!
//! A [`TimeoutTracker`] is armed when a move is issued and consulted whenever
//! the status is read. There is no timer task: the deadline is only compared
//! against the clock while someone is asking for the status.

use crate::status::{DeviceStatus, StatusCode};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Armed {
    started: Instant,
    deadline: Option<Instant>,
}

/// Tracks the deadline of the current move.
#[derive(Debug)]
pub struct TimeoutTracker {
    timeout: Option<Duration>,
    timeout_status: StatusCode,
    armed: Mutex<Option<Armed>>,
}

impl TimeoutTracker {
    /// `timeout = None` disables timeout detection.
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            timeout,
            timeout_status: StatusCode::NotReached,
            armed: Mutex::new(None),
        }
    }

    /// Status reported once the deadline passed (default `NotReached`).
    pub fn with_timeout_status(mut self, code: StatusCode) -> Self {
        self.timeout_status = code;
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Arm the tracker for a move expected to take `ramp`.
    pub fn begin(&self, ramp: Duration) {
        let started = Instant::now();
        let deadline = self
            .timeout
            .and_then(|t| started.checked_add(ramp)?.checked_add(t));
        *self.armed.lock() = Some(Armed { started, deadline });
    }

    /// Disarm, e.g. after the move finished or was stopped.
    pub fn clear(&self) {
        *self.armed.lock() = None;
    }

    pub fn is_armed(&self) -> bool {
        self.armed.lock().is_some()
    }

    /// Time since the current move was issued.
    pub fn elapsed(&self) -> Option<Duration> {
        self.armed.lock().map(|a| a.started.elapsed())
    }

    pub fn is_timed_out(&self) -> bool {
        matches!(
            *self.armed.lock(),
            Some(Armed { deadline: Some(d), .. }) if Instant::now() > d
        )
    }

    /// Fold timeout information into a hardware status.
    ///
    /// - an idle (`Ok`/`Warn`) device that is not yet at its target while a
    ///   move is armed is reported as `Busy`
    /// - a `Busy` device past the deadline is reported with the timeout status
    /// - an idle device at its target disarms the tracker
    pub fn combined_status(&self, hw: DeviceStatus, at_target: bool) -> DeviceStatus {
        if !self.is_armed() {
            return hw;
        }
        let mut st = hw;
        if matches!(st.code, StatusCode::Ok | StatusCode::Warn) {
            if at_target {
                self.clear();
                return st;
            }
            st = DeviceStatus::busy("target not yet reached");
        }
        if st.code == StatusCode::Busy && self.is_timed_out() {
            return DeviceStatus::new(self.timeout_status, "movement timed out");
        }
        st
    }
}
