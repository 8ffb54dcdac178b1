mod jobs;
mod scheduler;

use crate::jobs::SchedulerState;
use crate::scheduler::OpsScheduler;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tenantctl::daemon::shutdown::ShutdownCoordinator;
use tenantctl::{utils, Config};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(args.config.as_deref())?;
    utils::logger::init(&config.log.level, config.log.file.as_deref())?;

    tracing::info!("Starting tenantctl-scheduler v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = ShutdownCoordinator::new();
    let state = Arc::new(SchedulerState::new(config, shutdown.token()));

    let scheduler = OpsScheduler::new(state.clone()).await?;
    if scheduler.init_schedules().await? == 0 {
        tracing::warn!("No schedules configured, idling until shutdown");
    }
    scheduler.start().await?;

    shutdown.wait_for_signal().await;

    tracing::info!("Shutting down...");
    if let Err(e) = scheduler.shutdown().await {
        tracing::warn!("Scheduler shutdown error: {}", e);
    }

    // Let a run in progress finish rather than leave a tenant paused mid-copy
    while state.busy() {
        tracing::info!("Waiting for running job to finish");
        tokio::time::sleep(Duration::from_secs(5)).await;
    }

    tracing::info!("Scheduler stopped");
    Ok(())
}
