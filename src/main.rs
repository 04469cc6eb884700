//! `nicos` command-line entry point.
//!
//! ```bash
//! nicos --setup config/demo.toml list
//! nicos --setup config/demo.toml move sample_table 4.5 --wait
//! nicos --setup config/demo.toml status
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use nicos::cli::{execute, Cli};
use nicos::logging::{self, LoggingConfig};
use nicos::{Registry, Setup};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut setup = Setup::load_from(&cli.setup)
        .with_context(|| format!("loading setup {}", cli.setup.display()))?;
    if let Some(level) = &cli.log_level {
        setup.logging.level = level.clone();
    }
    if let Some(format) = cli.log_format {
        setup.logging.format = format;
    }
    logging::init(&LoggingConfig::from_settings(&setup.logging)?)?;

    let registry = Registry::from_setup(&setup).context("creating devices")?;
    for line in execute(&cli.command, &registry).await? {
        println!("{}", line);
    }
    Ok(())
}
