//! tenantctl - main entry point
//!
//! One-shot tenant operations: backup, rollout, restore drill.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tenantctl::backup::{remote, SnapshotEngine};
use tenantctl::drill::{DrillRequest, DrillRunner};
use tenantctl::rollout::health::HealthMonitor;
use tenantctl::rollout::{self, RolloutController};
use tenantctl::runtime::{ContainerRuntime, DockerCli, SystemRunner};
use tenantctl::{utils, Config};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Snapshot every tenant and the control plane for today
    Backup,

    /// Roll a digest-pinned image out to every tenant, canary first
    Rollout {
        /// `repo@sha256:…` or a bare `sha256:…` digest
        #[arg(value_name = "IMAGE_OR_DIGEST")]
        target: String,
    },

    /// Restore one tenant from a snapshot into scratch space and verify it
    Drill {
        #[arg(long)]
        tenant: String,

        /// Snapshot day (YYYY-MM-DD) or `latest`
        #[arg(long, default_value = "latest")]
        day: String,

        /// Keep the scratch copy afterwards
        #[arg(long)]
        keep: bool,

        /// Start a throwaway container on the restored data and health check it
        #[arg(long)]
        start_instance: bool,
    },

    /// List archived pre-rollout containers
    Archives,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    let config = Config::load(args.config.as_deref())?;

    let log_level = args.log_level.as_deref().unwrap_or(&config.log.level);
    utils::logger::init(log_level, config.log.file.as_deref())?;

    tracing::info!("tenantctl v{}", env!("CARGO_PKG_VERSION"));

    let runner = Arc::new(SystemRunner);
    let runtime: Arc<dyn ContainerRuntime> =
        Arc::new(DockerCli::new(config.runtime.docker_bin.clone(), runner.clone()));

    match args.command {
        Command::Backup => {
            let engine = SnapshotEngine::new(&config, Arc::clone(&runtime))
                .with_remote(remote::from_config(&config, runner));
            match engine.run().await {
                Ok(_) => Ok(ExitCode::SUCCESS),
                Err(_) => Ok(ExitCode::FAILURE),
            }
        }
        Command::Rollout { target } => {
            let monitor = Arc::new(HealthMonitor::from_config(&config, Arc::clone(&runtime))?);
            let run = RolloutController::new(&config, runtime, monitor).run(&target).await?;
            println!("{}", serde_json::to_string_pretty(&run)?);
            if run.is_halted() {
                Ok(ExitCode::from(2))
            } else {
                Ok(ExitCode::SUCCESS)
            }
        }
        Command::Drill {
            tenant,
            day,
            keep,
            start_instance,
        } => {
            let request = DrillRequest {
                day,
                tenant,
                keep,
                start_instance,
            };
            let report = DrillRunner::new(&config, runtime).drill(&request).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.passed() {
                Ok(ExitCode::SUCCESS)
            } else {
                Ok(ExitCode::FAILURE)
            }
        }
        Command::Archives => {
            for archive in rollout::archives(&config, runtime.as_ref()).await? {
                println!(
                    "{}\t{}\t{}\t{}",
                    archive.name,
                    archive.image,
                    if archive.running { "running" } else { "stopped" },
                    archive.id
                );
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}
