//! Service entry point.
//!
//! `sensord <config.json>` loads the configuration, builds one thread
//! group per enabled data handler, installs the signal handlers, starts
//! everything, and waits. Exit code 0 after a clean shutdown; non-zero
//! when configuration or startup fails.

use std::path::Path;
use std::process::ExitCode;

use anyhow::Context;
use sdpipe::group::GroupManager;
use sensor_collector::{config, handler, signals};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run() -> anyhow::Result<()> {
    let config_path = std::env::args()
        .nth(1)
        .context("usage: sensord <config.json>")?;
    let config_path = Path::new(&config_path);
    let base_dir = config_path.parent().unwrap_or_else(|| Path::new("."));

    let cfg = config::load_config(config_path)?;
    let (groups, pipes) = handler::build_groups(&cfg, base_dir, signals::shutdown_flag())?;
    info!(groups = groups.len(), "successfully set up from config file");

    signals::register_pipes(pipes);
    signals::install().context("failed to set up signal handlers")?;

    let manager = GroupManager::new();
    info!("starting all thread groups");
    manager
        .start_all(groups)
        .context("failed to start thread groups")?;
    info!("successfully started all thread groups");

    manager.wait_for_all(signals::shutdown_flag());
    Ok(())
}
