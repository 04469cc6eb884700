//! Command-line interface.
//!
//! Every invocation loads the setup, creates its devices and runs one
//! command against them. Commands return the lines to print so they can be
//! driven from tests without capturing stdout.

use crate::logging::OutputFormat;
use crate::registry::Registry;
use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nicos_core::capabilities::Allowed;
use nicos_core::value::Value;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "nicos")]
#[command(about = "Drive the devices of an instrument setup", long_about = None)]
pub struct Cli {
    /// Setup file describing the devices
    #[arg(short, long, default_value = "config/demo.toml")]
    pub setup: PathBuf,

    /// Log level, overrides the setup file
    #[arg(long)]
    pub log_level: Option<String>,

    /// Log format, overrides the setup file
    #[arg(long, value_enum)]
    pub log_format: Option<OutputFormat>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand, PartialEq)]
pub enum Command {
    /// List the devices of the setup
    List,

    /// Check whether a device may move to a target, without moving it
    Check { device: String, target: String },

    /// Read one device, or all of them
    Read { device: Option<String> },

    /// Show the status of one device, or all of them
    Status { device: Option<String> },

    /// Start a move
    Move {
        device: String,
        target: String,

        /// Wait until the device has arrived
        #[arg(long)]
        wait: bool,
    },

    /// Reset a device, clearing latched errors
    Reset { device: String },
}

/// Interpret a command-line target: booleans, integers and floats are taken
/// as such, anything else is a position name.
pub fn parse_value(text: &str) -> Value {
    let text = text.trim();
    match text {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    if let Ok(i) = text.parse::<i64>() {
        return Value::Int(i);
    }
    if let Ok(f) = text.parse::<f64>() {
        return Value::Float(f);
    }
    Value::Str(text.to_string())
}

const FRESH: Option<Duration> = Some(Duration::ZERO);

/// Run one command against the devices of `registry`.
pub async fn execute(command: &Command, registry: &Registry) -> Result<Vec<String>> {
    match command {
        Command::List => Ok(registry
            .names()
            .filter_map(|name| registry.get(name).ok())
            .map(|entry| {
                let access = if entry.is_moveable() { "moveable" } else { "readable" };
                format!("{:<16} {:<18} {}", entry.name(), entry.kind(), access)
            })
            .collect()),

        Command::Check { device, target } => {
            let dev = registry.moveable(device)?;
            let target = parse_value(target);
            Ok(vec![match dev.is_allowed(&target).await {
                Allowed::Yes => format!("{}: {} is allowed", device, target),
                Allowed::No(reason) => format!("{}: {} is not allowed: {}", device, target, reason),
            }])
        }

        Command::Read { device: Some(device) } => {
            let value = registry
                .get(device)?
                .readable()
                .read(FRESH)
                .await
                .with_context(|| format!("reading {}", device))?;
            Ok(vec![format!("{} = {}", device, value)])
        }
        Command::Read { device: None } => Ok(registry
            .read_all(FRESH)
            .await
            .into_iter()
            .map(|(name, result)| match result {
                Ok(value) => format!("{} = {}", name, value),
                Err(err) => format!("{}: read failed: {}", name, err),
            })
            .collect()),

        Command::Status { device: Some(device) } => {
            let status = registry
                .get(device)?
                .readable()
                .status(FRESH)
                .await
                .with_context(|| format!("polling status of {}", device))?;
            Ok(vec![format!("{}: {}", device, status)])
        }
        Command::Status { device: None } => Ok(registry
            .status_all(FRESH)
            .await
            .into_iter()
            .map(|(name, result)| match result {
                Ok(status) => format!("{}: {}", name, status),
                Err(err) => format!("{}: status failed: {}", name, err),
            })
            .collect()),

        Command::Move {
            device,
            target,
            wait,
        } => {
            let dev = registry.moveable(device)?;
            let target = parse_value(target);
            dev.start(target.clone())
                .await
                .with_context(|| format!("moving {} to {}", device, target))?;
            if !wait {
                return Ok(vec![format!("{}: started towards {}", device, target)]);
            }
            let value = dev
                .wait()
                .await
                .with_context(|| format!("waiting for {}", device))?;
            Ok(vec![format!("{} = {}", device, value)])
        }

        Command::Reset { device } => {
            let entry = registry.get(device)?;
            let status = entry
                .readable()
                .reset()
                .await
                .with_context(|| format!("resetting {}", device))?;
            if status.code == nicos_core::status::StatusCode::Error {
                bail!("{} is still in error after reset: {}", device, status);
            }
            Ok(vec![format!("{}: {}", device, status)])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_value() {
        assert_eq!(parse_value("3"), Value::Int(3));
        assert_eq!(parse_value("-1.5"), Value::Float(-1.5));
        assert_eq!(parse_value("true"), Value::Bool(true));
        assert_eq!(parse_value(" open "), Value::from("open"));
    }

    #[test]
    fn test_parse_arguments() {
        let cli = Cli::try_parse_from(["nicos", "--setup", "x.toml", "move", "sw", "open", "--wait"])
            .unwrap();
        assert_eq!(cli.setup, PathBuf::from("x.toml"));
        assert_eq!(
            cli.command,
            Command::Move {
                device: "sw".to_string(),
                target: "open".to_string(),
                wait: true,
            }
        );

        let cli = Cli::try_parse_from(["nicos", "--log-format", "json", "read"]).unwrap();
        assert_eq!(cli.log_format, Some(OutputFormat::Json));
        assert_eq!(cli.command, Command::Read { device: None });

        assert!(Cli::try_parse_from(["nicos", "teleport"]).is_err());
    }
}
