//! Supervising parent for the towerguard service.
//!
//! Launches the service binary, waits for it to exit, and restarts it after
//! a short delay. Ctrl-C reaches the whole process group, so an interrupt
//! stops both supervisor and child.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Delay before respawning a crashed service.
const RESTART_DELAY: Duration = Duration::from_secs(2);

/// Longer backoff when the binary cannot even be spawned.
const SPAWN_RETRY_DELAY: Duration = Duration::from_secs(5);

#[derive(Parser, Debug)]
#[command(name = "watchdog")]
#[command(about = "Restarts the towerguard service whenever it exits")]
#[command(version)]
struct CliArgs {
    /// Service binary to supervise; defaults to `towerguard` next to this
    /// executable.
    #[arg(long)]
    binary: Option<PathBuf>,

    /// Arguments forwarded to the service binary.
    #[arg(trailing_var_arg = true)]
    service_args: Vec<String>,
}

fn service_binary(args: &CliArgs) -> PathBuf {
    if let Some(path) = &args.binary {
        return path.clone();
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join("towerguard")))
        .unwrap_or_else(|| PathBuf::from("towerguard"))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = CliArgs::parse();
    let binary = service_binary(&args);
    info!(binary = %binary.display(), "watchdog supervising");

    loop {
        info!("starting service");
        match Command::new(&binary).args(&args.service_args).spawn() {
            Ok(mut child) => match child.wait() {
                Ok(status) => {
                    info!(code = status.code(), "service exited; restarting in 2s");
                    std::thread::sleep(RESTART_DELAY);
                }
                Err(e) => {
                    error!(error = %e, "wait failed; retrying in 5s");
                    std::thread::sleep(SPAWN_RETRY_DELAY);
                }
            },
            Err(e) => {
                error!(error = %e, binary = %binary.display(), "spawn failed; retrying in 5s");
                std::thread::sleep(SPAWN_RETRY_DELAY);
            }
        }
    }
}
