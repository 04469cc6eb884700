//! # nicos
//!
//! Instrument control on top of the device crates: setup files, the device
//! registry and the `nicos` command-line tool.
//!
//! - [`setup`]: TOML setup files with environment overrides
//! - [`registry`]: creates and attaches the devices of a setup
//! - [`logging`]: subscriber initialisation
//! - [`cli`]: command parsing and execution
//!
//! The device model itself lives in `nicos-core` (traits, values, status)
//! and `nicos-devices` (switchers, sequencers, simulated hardware); both are
//! re-exported here.

pub mod cli;
pub mod logging;
pub mod registry;
pub mod setup;

pub use nicos_core as core;
pub use nicos_devices as devices;
pub use registry::{DeviceEntry, Registry};
pub use setup::{DeviceConfig, Setup, SetupError};
