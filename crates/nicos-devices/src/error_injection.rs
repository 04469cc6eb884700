//! Error injection for simulated devices.
//!
//! Enables configurable failures so that retry, timeout and manual-fixing
//! paths of composite devices can be exercised without hardware.

use nicos_core::error::{NicosError, NicosResult};
use parking_lot::Mutex;
use serde::Deserialize;
use std::sync::Arc;

/// A single failure scenario.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ErrorScenario {
    /// The first `count` starts fail with a communication error.
    FailFirstStarts { count: u32 },
    /// The first `count` motions end in `Error` status instead of at target.
    FaultFirstMotions { count: u32 },
    /// Motion never completes; the device stays busy until stopped.
    Stuck,
}

/// Error injection configuration, shared between clones of a device.
#[derive(Clone, Debug, Default)]
pub struct ErrorConfig {
    scenarios: Arc<Vec<ErrorScenario>>,
    state: Arc<Mutex<ErrorState>>,
}

#[derive(Debug, Default)]
struct ErrorState {
    failed_starts: u32,
    faulted_motions: u32,
}

impl ErrorConfig {
    /// No injected errors.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn scenario(scenario: ErrorScenario) -> Self {
        Self::scenarios(vec![scenario])
    }

    pub fn scenarios(scenarios: Vec<ErrorScenario>) -> Self {
        Self {
            scenarios: Arc::new(scenarios),
            state: Arc::default(),
        }
    }

    pub fn is_none(&self) -> bool {
        self.scenarios.is_empty()
    }

    /// Consume one injected start failure, if any are left.
    pub fn check_start(&self, device: &str) -> NicosResult<()> {
        let mut state = self.state.lock();
        for scenario in self.scenarios.iter() {
            if let ErrorScenario::FailFirstStarts { count } = scenario {
                if state.failed_starts < *count {
                    state.failed_starts += 1;
                    return Err(NicosError::communication(
                        device,
                        format!(
                            "injected start failure {} of {}",
                            state.failed_starts, count
                        ),
                    ));
                }
            }
        }
        Ok(())
    }

    /// Whether the motion about to begin should end in a fault.
    pub fn take_motion_fault(&self) -> bool {
        let mut state = self.state.lock();
        for scenario in self.scenarios.iter() {
            if let ErrorScenario::FaultFirstMotions { count } = scenario {
                if state.faulted_motions < *count {
                    state.faulted_motions += 1;
                    return true;
                }
            }
        }
        false
    }

    pub fn is_stuck(&self) -> bool {
        self.scenarios.contains(&ErrorScenario::Stuck)
    }

    /// Reset counters so that the scenarios apply again from the start.
    pub fn reset(&self) {
        *self.state.lock() = ErrorState::default();
    }
}

/// Setup-file form of [`ErrorConfig`].
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct ErrorInjectionConfig {
    pub fail_starts: u32,
    pub fault_motions: u32,
    pub stuck: bool,
}

impl From<ErrorInjectionConfig> for ErrorConfig {
    fn from(cfg: ErrorInjectionConfig) -> Self {
        let mut scenarios = Vec::new();
        if cfg.fail_starts > 0 {
            scenarios.push(ErrorScenario::FailFirstStarts {
                count: cfg.fail_starts,
            });
        }
        if cfg.fault_motions > 0 {
            scenarios.push(ErrorScenario::FaultFirstMotions {
                count: cfg.fault_motions,
            });
        }
        if cfg.stuck {
            scenarios.push(ErrorScenario::Stuck);
        }
        ErrorConfig::scenarios(scenarios)
    }
}
