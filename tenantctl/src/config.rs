//! Configuration management for tenantctl.
//!
//! Loads configuration from an optional TOML file, applies environment
//! variable overrides (a `.env` file is honoured), then validates the result.
//! The validated [`Config`] is built once at startup and passed by reference.

use crate::utils::errors::{OpsError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub paths: PathsConfig,
    pub backup: BackupConfig,
    pub remote: RemoteConfig,
    pub runtime: RuntimeConfig,
    pub rollout: RolloutConfig,
    pub health: HealthConfig,
    pub drill: DrillConfig,
    pub schedule: ScheduleConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Append-only log file; console only when unset
    pub file: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// Root of all live platform state
    pub data_root: PathBuf,

    /// One sub-directory per tenant (defaults to `<data_root>/tenants`)
    pub tenants_root: Option<PathBuf>,

    /// Control-plane state tree (defaults to `<data_root>/control-plane`)
    pub control_plane_root: Option<PathBuf>,

    /// Daily snapshots land here as `<backup_root>/<YYYY-MM-DD>/`
    pub backup_root: PathBuf,

    /// Per-run rollout snapshots land here as `<rollout_root>/<run-id>/`
    pub rollout_root: PathBuf,

    /// Restore drills copy into this directory
    pub scratch_root: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Number of daily snapshots to keep
    pub retention: usize,

    /// Prometheus textfile written after every run
    pub metrics_file: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// rclone remote (e.g. `b2:platform-backups`), selects the checksum mirror
    pub rclone_remote: Option<String>,

    /// S3 bucket name, selects the delete-synchronized mirror
    pub s3_bucket: Option<String>,

    /// Key prefix below the remote root
    pub prefix: String,
}

/// Which off-host mirror strategy is configured.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteBackend {
    None,
    ChecksumMirror { remote: String },
    DeleteSyncMirror { bucket: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Container runtime CLI
    pub docker_bin: String,

    /// Label whose value is the tenant id
    pub tenant_label: String,

    /// Private network tenants are attached to
    pub network: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RolloutConfig {
    /// Repository used when a rollout is given a bare digest
    pub repository: Option<String>,

    /// Seconds a container gets to stop before it is killed
    pub stop_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    pub port: u16,
    pub path: String,
    pub attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub request_timeout_ms: u64,

    /// When set, health checks run via `exec` inside this container instead of
    /// from the host
    pub check_container: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DrillConfig {
    /// Image for the verification instance; the tenant's current image if unset
    pub image: Option<String>,

    /// Where the tenant data directory is mounted inside the container
    pub data_mount: String,

    /// Tenants drilled by the scheduler (empty = all)
    pub tenants: Vec<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    /// Cron expression (with seconds) for the backup run
    pub backup: Option<String>,

    /// Cron expression (with seconds) for restore drills
    pub drill: Option<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("/srv/platform"),
            tenants_root: None,
            control_plane_root: None,
            backup_root: PathBuf::from("/srv/backups/daily"),
            rollout_root: PathBuf::from("/srv/backups/rollout"),
            scratch_root: PathBuf::from("/srv/backups/drill-scratch"),
        }
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            retention: 7,
            metrics_file: PathBuf::from(
                "/var/lib/node_exporter/textfile_collector/tenant_backup.prom",
            ),
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            docker_bin: "docker".to_string(),
            tenant_label: "io.tenantctl.tenant".to_string(),
            network: "tenants".to_string(),
        }
    }
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            repository: None,
            stop_grace_secs: 30,
        }
    }
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            port: 7655,
            path: "/api/health".to_string(),
            attempts: 10,
            initial_backoff_ms: 1000,
            max_backoff_ms: 15000,
            request_timeout_ms: 3000,
            check_container: None,
        }
    }
}

impl Default for DrillConfig {
    fn default() -> Self {
        Self {
            image: None,
            data_mount: "/data".to_string(),
            tenants: Vec::new(),
        }
    }
}

impl PathsConfig {
    pub fn tenants_root(&self) -> PathBuf {
        self.tenants_root
            .clone()
            .unwrap_or_else(|| self.data_root.join("tenants"))
    }

    pub fn control_plane_root(&self) -> PathBuf {
        self.control_plane_root
            .clone()
            .unwrap_or_else(|| self.data_root.join("control-plane"))
    }
}

impl RemoteConfig {
    pub fn backend(&self) -> RemoteBackend {
        match (&self.rclone_remote, &self.s3_bucket) {
            (Some(remote), _) => RemoteBackend::ChecksumMirror {
                remote: remote.clone(),
            },
            (None, Some(bucket)) => RemoteBackend::DeleteSyncMirror {
                bucket: bucket.clone(),
            },
            (None, None) => RemoteBackend::None,
        }
    }
}

impl Config {
    /// Build the startup configuration: file (if any), then environment, then validation.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        let _ = dotenvy::dotenv();
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| OpsError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Apply key/value overrides. Empty values are treated as unset.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = get("LOG_FILE") {
            self.log.file = Some(PathBuf::from(v));
        }
        if let Some(v) = get("DATA_ROOT") {
            self.paths.data_root = PathBuf::from(v);
        }
        if let Some(v) = get("TENANTS_ROOT") {
            self.paths.tenants_root = Some(PathBuf::from(v));
        }
        if let Some(v) = get("CONTROL_PLANE_DIR") {
            self.paths.control_plane_root = Some(PathBuf::from(v));
        }
        if let Some(v) = get("BACKUP_ROOT") {
            self.paths.backup_root = PathBuf::from(v);
        }
        if let Some(v) = get("ROLLOUT_BACKUP_ROOT") {
            self.paths.rollout_root = PathBuf::from(v);
        }
        if let Some(v) = get("DRILL_SCRATCH_ROOT") {
            self.paths.scratch_root = PathBuf::from(v);
        }
        if let Some(v) = get("RETENTION_DAYS") {
            // Unparseable values become 0 and are rejected by validate()
            self.backup.retention = v.trim().parse().unwrap_or(0);
        }
        if let Some(v) = get("METRICS_FILE") {
            self.backup.metrics_file = PathBuf::from(v);
        }
        if let Some(v) = get("BACKUP_RCLONE_REMOTE") {
            self.remote.rclone_remote = Some(v);
        }
        if let Some(v) = get("BACKUP_S3_BUCKET") {
            self.remote.s3_bucket = Some(v);
        }
        if let Some(v) = get("BACKUP_REMOTE_PREFIX") {
            self.remote.prefix = v;
        }
        if let Some(v) = get("ROLLOUT_REPOSITORY") {
            self.rollout.repository = Some(v);
        }
    }

    /// Reject configurations the pipelines cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.backup.retention == 0 {
            return Err(OpsError::Config(
                "backup.retention must be a positive integer".into(),
            ));
        }
        if self.remote.rclone_remote.is_some() && self.remote.s3_bucket.is_some() {
            return Err(OpsError::Config(
                "remote.rclone_remote and remote.s3_bucket are mutually exclusive".into(),
            ));
        }
        for (name, path) in [
            ("paths.data_root", &self.paths.data_root),
            ("paths.backup_root", &self.paths.backup_root),
            ("paths.rollout_root", &self.paths.rollout_root),
            ("paths.scratch_root", &self.paths.scratch_root),
            ("backup.metrics_file", &self.backup.metrics_file),
        ] {
            if path.as_os_str().is_empty() {
                return Err(OpsError::Config(format!("{} must not be empty", name)));
            }
        }
        if self.health.attempts == 0 {
            return Err(OpsError::Config("health.attempts must be at least 1".into()));
        }
        if self.runtime.tenant_label.trim().is_empty() {
            return Err(OpsError::Config("runtime.tenant_label must not be empty".into()));
        }
        Ok(())
    }
}
