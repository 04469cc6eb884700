//! Setup files.
//!
//! A setup describes the devices of an instrument and how they are attached
//! to each other. It is loaded from a TOML file and can be overridden from
//! the environment with `NICOS_`-prefixed variables, nested keys separated by
//! a double underscore (`NICOS_LOGGING__LEVEL=debug`).
//!
//! ```toml
//! description = "sample table"
//!
//! [logging]
//! level = "info"
//!
//! [[devices]]
//! type = "virtual_motor"
//! name = "stx"
//! limits = [-50, 50]
//! speed = 5.0
//!
//! [[devices]]
//! type = "switcher"
//! name = "stx_pos"
//! moveable = "stx"
//! precision = 0.01
//! positions = [
//!     { name = "in", value = 0.0 },
//!     { name = "out", value = 40.0 },
//! ]
//! ```
//!
//! Devices may be listed in any order; attachments are resolved by name in
//! [`crate::registry`].

use crate::logging::OutputFormat;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use nicos_core::error_recovery::RetryPolicy;
use nicos_core::value::Value;
use nicos_devices::ErrorInjectionConfig;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors while loading or validating a setup.
#[derive(Debug, Error)]
pub enum SetupError {
    #[error("setup file {} not found", .0.display())]
    NotFound(PathBuf),
    #[error("failed to load setup: {0}")]
    Load(#[source] Box<figment::Error>),
    #[error("device '{0}' is defined more than once")]
    DuplicateDevice(String),
    #[error("device '{device}': {message}")]
    Invalid { device: String, message: String },
}

impl From<figment::Error> for SetupError {
    fn from(err: figment::Error) -> Self {
        SetupError::Load(Box::new(err))
    }
}

/// A complete setup file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Setup {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Retry budget of sequencing devices that do not set their own.
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct LoggingSettings {
    pub level: String,
    pub format: OutputFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: OutputFormat::Compact,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct RetrySettings {
    pub max_attempts: u32,
    #[serde(with = "humantime_serde")]
    pub backoff: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        let policy = RetryPolicy::default();
        Self {
            max_attempts: policy.max_attempts,
            backoff: policy.backoff_delay,
        }
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        RetryPolicy {
            max_attempts: settings.max_attempts,
            backoff_delay: settings.backoff,
        }
    }
}

/// One named position of a single-device switcher.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct PositionConfig {
    pub name: String,
    pub value: Value,
}

/// One named position of a multi-device switcher: one value per attached
/// moveable, followed by one per read-back device.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(deny_unknown_fields)]
pub struct MultiPositionConfig {
    pub name: String,
    pub values: Vec<Value>,
}

fn default_true() -> bool {
    true
}

/// A device declaration, tagged by `type`.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeviceConfig {
    VirtualMotor {
        name: String,
        #[serde(default)]
        position: f64,
        /// Units per second; 0 moves instantly.
        #[serde(default)]
        speed: f64,
        #[serde(default)]
        precision: f64,
        limits: (f64, f64),
        #[serde(default)]
        user_limits: Option<(f64, f64)>,
        #[serde(default)]
        offset: f64,
        #[serde(default, with = "humantime_serde")]
        timeout: Option<Duration>,
        #[serde(default)]
        reference_position: f64,
        #[serde(default)]
        unit: String,
        #[serde(default)]
        errors: ErrorInjectionConfig,
    },
    Switcher {
        name: String,
        moveable: String,
        positions: Vec<PositionConfig>,
        #[serde(default)]
        precision: Option<f64>,
        #[serde(default)]
        fallback: Option<String>,
        #[serde(default = "default_true")]
        blocking: bool,
        #[serde(default)]
        relax_mapping: bool,
    },
    ReadonlySwitcher {
        name: String,
        readable: String,
        positions: Vec<PositionConfig>,
        #[serde(default)]
        precision: Option<f64>,
        #[serde(default)]
        fallback: Option<String>,
    },
    MultiSwitcher {
        name: String,
        moveables: Vec<String>,
        #[serde(default)]
        readables: Vec<String>,
        positions: Vec<MultiPositionConfig>,
        #[serde(default)]
        precision: Vec<f64>,
        #[serde(default)]
        fallback: Option<String>,
        #[serde(default = "default_true")]
        blocking: bool,
    },
    Locked {
        name: String,
        device: String,
        lock: String,
        unlock_value: Value,
        #[serde(default)]
        lock_value: Option<Value>,
        #[serde(default)]
        keep_fixed: bool,
        #[serde(default)]
        retry: Option<RetrySettings>,
    },
}

impl DeviceConfig {
    pub fn name(&self) -> &str {
        match self {
            DeviceConfig::VirtualMotor { name, .. }
            | DeviceConfig::Switcher { name, .. }
            | DeviceConfig::ReadonlySwitcher { name, .. }
            | DeviceConfig::MultiSwitcher { name, .. }
            | DeviceConfig::Locked { name, .. } => name,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DeviceConfig::VirtualMotor { .. } => "virtual_motor",
            DeviceConfig::Switcher { .. } => "switcher",
            DeviceConfig::ReadonlySwitcher { .. } => "readonly_switcher",
            DeviceConfig::MultiSwitcher { .. } => "multi_switcher",
            DeviceConfig::Locked { .. } => "locked",
        }
    }

    /// Names of the devices this one is attached to.
    pub fn attachments(&self) -> Vec<&str> {
        match self {
            DeviceConfig::VirtualMotor { .. } => Vec::new(),
            DeviceConfig::Switcher { moveable, .. } => vec![moveable.as_str()],
            DeviceConfig::ReadonlySwitcher { readable, .. } => vec![readable.as_str()],
            DeviceConfig::MultiSwitcher {
                moveables,
                readables,
                ..
            } => moveables
                .iter()
                .chain(readables.iter())
                .map(String::as_str)
                .collect(),
            DeviceConfig::Locked { device, lock, .. } => vec![device.as_str(), lock.as_str()],
        }
    }
}

impl Setup {
    /// Load a setup file, with `NICOS_` environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, SetupError> {
        let path = path.as_ref();
        // a missing file would silently load as an empty setup
        if !path.is_file() {
            return Err(SetupError::NotFound(path.to_path_buf()));
        }
        let setup: Setup = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("NICOS_").split("__"))
            .extract()?;
        setup.validate()?;
        tracing::debug!(
            "loaded setup {} with {} devices",
            path.display(),
            setup.devices.len()
        );
        Ok(setup)
    }

    /// Parse a setup from a TOML string, without environment overrides.
    pub fn from_toml(text: &str) -> Result<Self, SetupError> {
        let setup: Setup = Figment::from(Toml::string(text)).extract()?;
        setup.validate()?;
        Ok(setup)
    }

    /// Structural checks that need no device instances.
    pub fn validate(&self) -> Result<(), SetupError> {
        let mut names = HashSet::new();
        for dev in &self.devices {
            let name = dev.name();
            if name.is_empty() {
                return Err(SetupError::Invalid {
                    device: dev.kind().to_string(),
                    message: "device name must not be empty".to_string(),
                });
            }
            if !names.insert(name) {
                return Err(SetupError::DuplicateDevice(name.to_string()));
            }
            if dev.attachments().contains(&name) {
                return Err(SetupError::Invalid {
                    device: name.to_string(),
                    message: "a device cannot be attached to itself".to_string(),
                });
            }
        }
        if self.retry.max_attempts == 0 {
            return Err(SetupError::Invalid {
                device: "retry".to_string(),
                message: "max_attempts must be at least 1".to_string(),
            });
        }
        Ok(())
    }

    pub fn device(&self, name: &str) -> Option<&DeviceConfig> {
        self.devices.iter().find(|dev| dev.name() == name)
    }
}
