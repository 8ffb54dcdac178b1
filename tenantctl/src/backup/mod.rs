//! Daily tenant snapshots.
//!
//! [`SnapshotEngine::run`] produces one consistent copy of every tenant data
//! directory and of the control-plane tree under `<backup-root>/<YYYY-MM-DD>/`,
//! verifies it, publishes it as `latest`, rotates old days and mirrors the
//! day off-host. The metrics file is rewritten on every exit path.
//!
//! Every run writes into a hidden staging directory,
//! `<backup-root>/.<day>.partial-<token>`, and the staging tree only replaces
//! the day directory once it passed verification. A snapshot that was
//! published is never written into, so a failed re-run of the same day leaves
//! the earlier copy untouched.

pub mod freeze;
pub mod integrity;
pub mod latest;
pub mod metrics;
pub mod remote;
pub mod retention;

use crate::config::Config;
use crate::fs::mirror::{mirror, MirrorStats};
use crate::runtime::{ContainerRuntime, Inventory};
use crate::tenant::{self, Tenant};
use crate::utils::errors::{OpsError, Result};
use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};
use freeze::FreezeGuard;
use futures_util::FutureExt;
use integrity::IntegrityStatus;
use latest::{FileLatestStore, LatestRecord, LatestStore};
use metrics::MetricsPublisher;
use remote::RemoteMirror;
use retention::DAY_FORMAT;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io;
use std::panic::AssertUnwindSafe;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const TENANTS_DIR: &str = "tenants";
pub const CONTROL_PLANE_DIR: &str = "control-plane";
pub const META_DIR: &str = "meta";

const PARTIAL_MARK: &str = ".partial-";
const RETIRED_MARK: &str = ".replaced-";

/// Off-host leg of a backup run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    NotConfigured,
    NotAttempted,
    Synced,
    Failed,
}

/// Outcome of one backup run, fed to the metrics file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRunResult {
    pub success: bool,
    pub day: String,
    pub completed_at: DateTime<Utc>,
    pub tenants: BTreeMap<String, MirrorStats>,
    pub control_plane: Option<MirrorStats>,
    pub integrity: Vec<IntegrityStatus>,
    pub remote: RemoteStatus,
    pub expired_days: Vec<String>,
    pub error: Option<String>,
}

impl BackupRunResult {
    pub fn new(day: &str) -> Self {
        Self {
            success: false,
            day: day.to_string(),
            completed_at: Utc::now(),
            tenants: BTreeMap::new(),
            control_plane: None,
            integrity: Vec::new(),
            remote: RemoteStatus::NotAttempted,
            expired_days: Vec::new(),
            error: None,
        }
    }
}

/// Contents of `meta/run.json`
#[derive(Debug, Serialize)]
struct RunManifest<'a> {
    day: &'a str,
    host: String,
    created_at: String,
    tenants: &'a BTreeMap<String, MirrorStats>,
    control_plane: &'a Option<MirrorStats>,
}

pub struct SnapshotEngine<'a> {
    config: &'a Config,
    runtime: Arc<dyn ContainerRuntime>,
    latest: Arc<dyn LatestStore>,
    remote: Option<Arc<dyn RemoteMirror>>,
    metrics: MetricsPublisher,
}

impl<'a> SnapshotEngine<'a> {
    pub fn new(config: &'a Config, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            config,
            runtime,
            latest: Arc::new(FileLatestStore::new(&config.paths.backup_root)),
            remote: None,
            metrics: MetricsPublisher::new(&config.backup.metrics_file),
        }
    }

    pub fn with_latest_store(mut self, latest: Arc<dyn LatestStore>) -> Self {
        self.latest = latest;
        self
    }

    pub fn with_remote(mut self, remote: Option<Arc<dyn RemoteMirror>>) -> Self {
        self.remote = remote;
        self
    }

    /// Back up today (UTC).
    pub async fn run(&self) -> Result<BackupRunResult> {
        self.run_for_day(Utc::now().date_naive()).await
    }

    pub async fn run_for_day(&self, day: NaiveDate) -> Result<BackupRunResult> {
        let day = day.format(DAY_FORMAT).to_string();
        let mut result = BackupRunResult::new(&day);
        info!(day = %day, "Starting backup run");

        let outcome = AssertUnwindSafe(self.execute(&day, &mut result))
            .catch_unwind()
            .await;
        result.completed_at = Utc::now();

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(panic) => {
                result.success = false;
                result.error = Some("backup run panicked".into());
                self.publish_metrics(&result);
                std::panic::resume_unwind(panic);
            }
        };

        match &outcome {
            Ok(()) => info!(day = %day, tenants = result.tenants.len(), "Backup run completed"),
            Err(e) => {
                result.success = false;
                result.error = Some(e.to_string());
                error!(day = %day, error = %e, "Backup run failed");
            }
        }
        self.publish_metrics(&result);

        outcome.map(|()| result)
    }

    async fn execute(&self, day: &str, result: &mut BackupRunResult) -> Result<()> {
        let paths = &self.config.paths;
        let tenants_root = paths.tenants_root();
        let control_plane_root = paths.control_plane_root();
        require_dir(&tenants_root, "tenants root")?;
        require_dir(&control_plane_root, "control-plane root")?;
        std::fs::create_dir_all(&paths.backup_root).map_err(|e| {
            OpsError::Precondition(format!(
                "cannot create backup root {}: {}",
                paths.backup_root.display(),
                e
            ))
        })?;

        sweep_staging(&paths.backup_root)?;

        let token = Uuid::new_v4().simple().to_string();
        let token = &token[..8];
        let day_dir = paths.backup_root.join(day);
        let staging = paths.backup_root.join(hidden_name(day, PARTIAL_MARK, token));
        let retired = paths.backup_root.join(hidden_name(day, RETIRED_MARK, token));

        let staged = match self.stage(&staging, result).await {
            Ok(()) => promote(&staging, &day_dir, &retired),
            Err(e) => Err(e),
        };
        if let Err(e) = staged {
            discard(&staging);
            return Err(e);
        }
        info!(day = %day, "Snapshot verified and in place");

        self.latest.publish(LatestRecord {
            day: day.to_string(),
            verified_at: Utc::now(),
        })?;
        info!(day = %day, "Published as latest");

        let retention = self.config.backup.retention;
        let backup_root = paths.backup_root.clone();
        result.expired_days =
            tokio::task::spawn_blocking(move || retention::rotate_local(&backup_root, retention))
                .await??;

        match &self.remote {
            None => result.remote = RemoteStatus::NotConfigured,
            Some(remote) => match remote.sync(day, &day_dir).await {
                Ok(()) => {
                    result.remote = RemoteStatus::Synced;
                    info!(backend = remote.name(), day = %day, "Remote sync completed");
                    retention::rotate_remote(remote.as_ref(), retention).await;
                }
                Err(e) => {
                    result.remote = RemoteStatus::Failed;
                    error!(backend = remote.name(), day = %day, error = %e, "Remote sync failed, local snapshot is intact");
                    return Err(e);
                }
            },
        }

        result.success = true;
        Ok(())
    }

    /// Copy everything into `staging` and verify it.
    async fn stage(&self, staging: &Path, result: &mut BackupRunResult) -> Result<()> {
        let tenants_dir = staging.join(TENANTS_DIR);
        tokio::fs::create_dir_all(&tenants_dir).await?;

        let tenants = tenant::discover(self.config, self.runtime.as_ref()).await?;
        for tenant in &tenants {
            let stats = self.snapshot_tenant(tenant, &tenants_dir.join(&tenant.id)).await?;
            info!(
                tenant = %tenant.id,
                copied = stats.files_copied,
                bytes = stats.bytes_copied,
                "Tenant snapshot taken"
            );
            result.tenants.insert(tenant.id.clone(), stats);
        }

        let control_plane_root = self.config.paths.control_plane_root();
        let stats = mirror(&control_plane_root, &staging.join(CONTROL_PLANE_DIR)).await?;
        debug!(copied = stats.files_copied, "Control-plane snapshot taken");
        result.control_plane = Some(stats);

        self.write_meta(staging, result).await?;

        let report = integrity::verify(staging).await?;
        result.integrity = report.statuses.clone();
        report.ensure_ok()
    }

    /// Copy one tenant, frozen if its container is running.
    async fn snapshot_tenant(&self, tenant: &Tenant, dest: &Path) -> Result<MirrorStats> {
        let Some(container) = tenant.running_container() else {
            debug!(tenant = %tenant.id, "No running container, copying without freeze");
            return mirror(&tenant.data_dir, dest).await;
        };

        let guard = FreezeGuard::acquire(Arc::clone(&self.runtime), &container.name).await;
        let copied = AssertUnwindSafe(mirror(&tenant.data_dir, dest))
            .catch_unwind()
            .await;
        let released = guard.release().await;

        let stats = match copied {
            Ok(stats) => stats?,
            Err(panic) => std::panic::resume_unwind(panic),
        };
        released?;
        Ok(stats)
    }

    async fn write_meta(&self, day_dir: &Path, result: &BackupRunResult) -> Result<()> {
        let meta_dir = day_dir.join(META_DIR);
        tokio::fs::create_dir_all(&meta_dir).await?;

        let created_at = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        tokio::fs::write(meta_dir.join("created_at_utc.txt"), format!("{}\n", created_at)).await?;

        let inventory = match self.runtime.inventory().await {
            Ok(inventory) => inventory,
            Err(e) => {
                warn!(error = %e, "Failed to collect container inventory");
                Inventory::default()
            }
        };
        tokio::fs::write(meta_dir.join("containers.txt"), inventory.containers).await?;
        tokio::fs::write(meta_dir.join("images.txt"), inventory.images).await?;

        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_string());
        let manifest = RunManifest {
            day: &result.day,
            host,
            created_at,
            tenants: &result.tenants,
            control_plane: &result.control_plane,
        };
        tokio::fs::write(meta_dir.join("run.json"), serde_json::to_vec_pretty(&manifest)?).await?;
        Ok(())
    }

    fn publish_metrics(&self, result: &BackupRunResult) {
        if let Err(e) = self.metrics.publish(result) {
            error!(error = %e, "Failed to write backup metrics");
        }
    }
}

fn require_dir(path: &Path, what: &str) -> Result<()> {
    if path.is_dir() {
        Ok(())
    } else {
        Err(OpsError::Precondition(format!(
            "{} {} is not a directory",
            what,
            path.display()
        )))
    }
}

fn hidden_name(day: &str, mark: &str, token: &str) -> String {
    format!(".{}{}{}", day, mark, token)
}

/// Day named by a staging or retired directory, and whether it is retired
fn parse_hidden(name: &str) -> Option<(&str, bool)> {
    let rest = name.strip_prefix('.')?;
    if let Some((day, _)) = rest.split_once(PARTIAL_MARK) {
        return Some((day, false));
    }
    rest.split_once(RETIRED_MARK).map(|(day, _)| (day, true))
}

/// Put a verified staging tree in place as `day_dir`. An earlier snapshot of
/// the same day is moved aside first and deleted only after the swap.
fn promote(staging: &Path, day_dir: &Path, retired: &Path) -> Result<()> {
    match std::fs::symlink_metadata(day_dir) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            std::fs::rename(staging, day_dir)?;
            return Ok(());
        }
        Err(e) => return Err(e.into()),
        Ok(_) => {}
    }

    std::fs::rename(day_dir, retired)?;
    if let Err(e) = std::fs::rename(staging, day_dir) {
        if let Err(back) = std::fs::rename(retired, day_dir) {
            error!(day_dir = %day_dir.display(), retired = %retired.display(), error = %back, alert = "snapshot_misplaced", "Failed to move the previous snapshot back");
        }
        return Err(e.into());
    }
    info!(day_dir = %day_dir.display(), "Replaced earlier snapshot of the same day");
    if let Err(e) = std::fs::remove_dir_all(retired) {
        warn!(path = %retired.display(), error = %e, "Failed to delete replaced snapshot");
    }
    Ok(())
}

fn discard(staging: &Path) {
    if !staging.exists() {
        return;
    }
    match std::fs::remove_dir_all(staging) {
        Ok(()) => debug!(path = %staging.display(), "Discarded unverified snapshot"),
        Err(e) => warn!(path = %staging.display(), error = %e, "Failed to discard unverified snapshot"),
    }
}

/// Clean up after a run that died mid-way: partial trees are deleted, and a
/// retired snapshot whose replacement never landed is moved back.
fn sweep_staging(backup_root: &Path) -> Result<()> {
    for entry in std::fs::read_dir(backup_root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some((day, retired)) = parse_hidden(&name) else {
            continue;
        };
        let path = entry.path();
        let day_dir = backup_root.join(day);
        if retired && !day_dir.exists() {
            warn!(day = %day, "Restoring snapshot left aside by an interrupted run");
            std::fs::rename(&path, &day_dir)?;
        } else {
            warn!(path = %path.display(), "Removing leftover from an interrupted run");
            std::fs::remove_dir_all(&path)?;
        }
    }
    Ok(())
}
