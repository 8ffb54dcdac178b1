//! The two scheduled jobs and the state they share.

use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tenantctl::backup::{remote, SnapshotEngine, TENANTS_DIR};
use tenantctl::drill::{DrillRequest, DrillRunner, LATEST_DAY};
use tenantctl::runtime::{CommandRunner, ContainerRuntime, DockerCli, SystemRunner};
use tenantctl::Config;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    Backup,
    Drill,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Backup => f.write_str("backup"),
            JobKind::Drill => f.write_str("drill"),
        }
    }
}

pub struct SchedulerState {
    pub config: Config,
    pub runner: Arc<dyn CommandRunner>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub shutdown: CancellationToken,
    /// One slot for every job kind: backups and drills never overlap
    running: Arc<Mutex<Option<JobKind>>>,
}

impl SchedulerState {
    pub fn new(config: Config, shutdown: CancellationToken) -> Self {
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner);
        let runtime = Arc::new(DockerCli::new(config.runtime.docker_bin.clone(), runner.clone()));
        Self {
            config,
            runner,
            runtime,
            shutdown,
            running: Arc::new(Mutex::new(None)),
        }
    }

    /// Take the job slot for `kind`, or return the kind holding it.
    pub fn try_begin(&self, kind: JobKind) -> Result<RunningJob, JobKind> {
        let mut running = match self.running.lock() {
            Ok(running) => running,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(current) = *running {
            return Err(current);
        }
        *running = Some(kind);
        Ok(RunningJob {
            running: Arc::clone(&self.running),
        })
    }

    /// Whether any job is mid-run
    pub fn busy(&self) -> bool {
        self.running.lock().map(|r| r.is_some()).unwrap_or(false)
    }
}

/// Frees the job slot when the job ends, however it ends
pub struct RunningJob {
    running: Arc<Mutex<Option<JobKind>>>,
}

impl Drop for RunningJob {
    fn drop(&mut self) {
        match self.running.lock() {
            Ok(mut running) => *running = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }
}

pub async fn run_backup(state: &SchedulerState) {
    let engine = SnapshotEngine::new(&state.config, Arc::clone(&state.runtime))
        .with_remote(remote::from_config(&state.config, Arc::clone(&state.runner)));
    match engine.run().await {
        Ok(result) => tracing::info!(day = %result.day, tenants = result.tenants.len(), "Scheduled backup succeeded"),
        Err(e) => tracing::error!(error = %e, "Scheduled backup failed"),
    }
}

pub async fn run_drills(state: &SchedulerState) {
    let runner = DrillRunner::new(&state.config, Arc::clone(&state.runtime));
    let day = match runner.resolve_day(LATEST_DAY) {
        Ok(day) => day,
        Err(e) => {
            tracing::error!(error = %e, "Cannot resolve latest snapshot for drills");
            return;
        }
    };

    let tenants = if state.config.drill.tenants.is_empty() {
        match snapshot_tenants(&state.config.paths.backup_root.join(&day)) {
            Ok(tenants) => tenants,
            Err(e) => {
                tracing::error!(day = %day, error = %e, "Cannot list tenants in snapshot");
                return;
            }
        }
    } else {
        state.config.drill.tenants.clone()
    };

    let mut failed = 0usize;
    for tenant in &tenants {
        if state.shutdown.is_cancelled() {
            tracing::info!("Shutting down, remaining drills skipped");
            break;
        }
        let request = DrillRequest {
            day: day.clone(),
            tenant: tenant.clone(),
            keep: false,
            start_instance: false,
        };
        match runner.drill(&request).await {
            Ok(report) if report.passed() => {}
            Ok(_) => failed += 1,
            Err(e) => {
                failed += 1;
                tracing::error!(tenant = %tenant, day = %day, error = %e, "Restore drill could not run");
            }
        }
    }

    tracing::info!(day = %day, total = tenants.len(), failed, "Scheduled drills finished");
}

/// Tenant ids present in one snapshot day, sorted
pub fn snapshot_tenants(day_dir: &Path) -> std::io::Result<Vec<String>> {
    let mut tenants = Vec::new();
    for entry in std::fs::read_dir(day_dir.join(TENANTS_DIR))? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            tenants.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    tenants.sort();
    Ok(tenants)
}
