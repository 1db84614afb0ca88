//! CLI entry point for the ROV communication hub.
//!
//! ```bash
//! rov-hub --config config/hub.toml
//! rov-hub --bind 127.0.0.1:50000 --log-level debug
//! rov-hub --print-config
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use rov_hub::{config::HubConfig, logging, Hub};
use std::net::SocketAddr;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "rov-hub")]
#[command(
    about = "Bridges the surface control station and the on-board device boards",
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(long, default_value = rov_hub::config::DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the logging level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Override the surface listen address
    #[arg(long)]
    bind: Option<SocketAddr>,

    /// Print the effective configuration as TOML and exit
    #[arg(long)]
    print_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = HubConfig::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    if let Some(level) = cli.log_level {
        config.logging.level = level;
    }
    if let Some(bind) = cli.bind {
        config.surface.bind = bind;
    }

    if cli.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    config.validate().context("invalid configuration")?;
    logging::init_from_config(&config)?;

    let hub = Hub::start(&config).await?;
    if !hub.surface_running() {
        tracing::warn!("Running without a surface link");
    }

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");
    Ok(())
}
