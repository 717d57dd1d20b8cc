//! Towerguard service binary.
//!
//! Loads (or creates) the JSON config, brings the monitoring pipeline up
//! with simulated sources unless a hardware driver is wired in, and runs
//! until the process is stopped. The `watchdog` binary supervises this one
//! in production.
//!
//! ```bash
//! # Run with defaults (config.json in the working directory)
//! cargo run --release
//!
//! # Custom config and bounded run (useful for soak tests)
//! cargo run --release -- --config /etc/towerguard/config.json --run-for 60
//! ```

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;
use towerguard::daq::manager::simulated_factory;
use towerguard::{Config, MonitorService};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "towerguard")]
#[command(about = "Tower structural-health monitoring service")]
#[command(version)]
struct CliArgs {
    /// Path to the JSON configuration (created with defaults when missing)
    #[arg(long, default_value = "config.json")]
    config: PathBuf,

    /// Root directory for data, logs, and snapshots
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Seed for the simulated acceleration sources
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Stop after this many seconds (run forever when omitted)
    #[arg(long)]
    run_for: Option<u64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = CliArgs::parse();
    let config_path = if args.config.is_absolute() {
        args.config.clone()
    } else {
        args.root.join(&args.config)
    };

    let config = Config::load(&config_path)
        .with_context(|| format!("loading config from {}", config_path.display()))?;
    let (fs_hw, fs_eff) = config.rates()?;
    info!(
        devices = config.devices.len(),
        fs_hw,
        fs_eff,
        samples_per_read = config.samples_per_read,
        "configuration loaded"
    );

    let mut service = MonitorService::start(
        &config,
        &args.root,
        simulated_factory(args.seed),
        None,
    )
    .context("starting monitor service")?;

    match args.run_for {
        Some(seconds) => {
            info!(seconds, "bounded run");
            std::thread::sleep(Duration::from_secs(seconds));
            service.stop();
        }
        None => loop {
            std::thread::sleep(Duration::from_secs(3600));
        },
    }

    Ok(())
}
