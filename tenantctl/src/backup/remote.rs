//! Off-host snapshot mirrors.
//!
//! Two interchangeable strategies, selected by configuration:
//! - [`ChecksumMirror`]: `rclone sync --checksum`, verified incremental copy
//! - [`DeleteSyncMirror`]: `aws s3 sync --delete`
//!
//! Both converge the remote day directory to an exact copy of the local one,
//! removing remote-only files.

use crate::backup::retention::{is_day_name, select_expired};
use crate::config::{Config, RemoteBackend};
use crate::runtime::command::{args, CommandOutput, CommandRunner};
use crate::utils::errors::{OpsError, Result};
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[async_trait]
pub trait RemoteMirror: Send + Sync {
    fn name(&self) -> &'static str;

    /// Make the remote copy of `day` identical to `local_dir`.
    async fn sync(&self, day: &str, local_dir: &Path) -> Result<()>;

    /// Day directories present remotely.
    async fn list_days(&self) -> Result<Vec<String>>;

    async fn delete_day(&self, day: &str) -> Result<()>;

    /// Delete remote days beyond `retention`.
    ///
    /// Individual deletions that fail are logged and skipped; only a failed
    /// listing is an error.
    async fn rotate(&self, retention: usize) -> Result<Vec<String>> {
        let expired = select_expired(self.list_days().await?, retention);
        let mut removed = Vec::new();
        for day in expired {
            match self.delete_day(&day).await {
                Ok(()) => removed.push(day),
                Err(e) => warn!(backend = self.name(), day = %day, error = %e, "Failed to delete remote snapshot"),
            }
        }
        Ok(removed)
    }
}

/// Build the configured mirror, if any.
pub fn from_config(config: &Config, runner: Arc<dyn CommandRunner>) -> Option<Arc<dyn RemoteMirror>> {
    let prefix = config.remote.prefix.clone();
    match config.remote.backend() {
        RemoteBackend::None => None,
        RemoteBackend::ChecksumMirror { remote } => {
            Some(Arc::new(ChecksumMirror::new(runner, remote, prefix)))
        }
        RemoteBackend::DeleteSyncMirror { bucket } => {
            Some(Arc::new(DeleteSyncMirror::new(runner, bucket, prefix)))
        }
    }
}

fn join_remote(base: &str, prefix: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        base.trim_end_matches('/').to_string()
    } else {
        format!("{}/{}", base.trim_end_matches('/'), prefix)
    }
}

fn check(tool: &str, output: CommandOutput) -> Result<String> {
    if output.success() {
        Ok(output.stdout)
    } else {
        Err(OpsError::RemoteSync(format!(
            "{} exited with {:?}: {}",
            tool,
            output.code,
            output.stderr.trim()
        )))
    }
}

pub struct ChecksumMirror {
    runner: Arc<dyn CommandRunner>,
    root: String,
}

impl ChecksumMirror {
    /// `remote` is an rclone remote path such as `b2:platform-backups`.
    pub fn new(runner: Arc<dyn CommandRunner>, remote: String, prefix: String) -> Self {
        Self {
            runner,
            root: join_remote(&remote, &prefix),
        }
    }

    async fn rclone(&self, argv: Vec<String>) -> Result<String> {
        check("rclone", self.runner.run("rclone", &argv).await?)
    }
}

#[async_trait]
impl RemoteMirror for ChecksumMirror {
    fn name(&self) -> &'static str {
        "rclone"
    }

    async fn sync(&self, day: &str, local_dir: &Path) -> Result<()> {
        let dest = format!("{}/{}", self.root, day);
        info!(dest = %dest, "Syncing snapshot with checksum verification");
        self.rclone(args([
            "sync",
            "--checksum",
            "--create-empty-src-dirs",
            &*local_dir.to_string_lossy(),
            dest.as_str(),
        ]))
        .await
        .map(|_| ())
    }

    async fn list_days(&self) -> Result<Vec<String>> {
        let stdout = self
            .rclone(args(["lsf", "--dirs-only", self.root.as_str()]))
            .await?;
        Ok(stdout
            .lines()
            .map(|line| line.trim().trim_end_matches('/').to_string())
            .filter(|name| is_day_name(name))
            .collect())
    }

    async fn delete_day(&self, day: &str) -> Result<()> {
        let target = format!("{}/{}", self.root, day);
        self.rclone(args(["purge", target.as_str()])).await.map(|_| ())
    }
}

pub struct DeleteSyncMirror {
    runner: Arc<dyn CommandRunner>,
    root: String,
}

impl DeleteSyncMirror {
    pub fn new(runner: Arc<dyn CommandRunner>, bucket: String, prefix: String) -> Self {
        let base = format!("s3://{}", bucket.trim_start_matches("s3://"));
        Self {
            runner,
            root: join_remote(&base, &prefix),
        }
    }

    async fn aws(&self, argv: Vec<String>) -> Result<String> {
        check("aws", self.runner.run("aws", &argv).await?)
    }
}

#[async_trait]
impl RemoteMirror for DeleteSyncMirror {
    fn name(&self) -> &'static str {
        "s3"
    }

    async fn sync(&self, day: &str, local_dir: &Path) -> Result<()> {
        let dest = format!("{}/{}/", self.root, day);
        info!(dest = %dest, "Syncing snapshot with delete");
        self.aws(args([
            "s3",
            "sync",
            "--delete",
            "--only-show-errors",
            &*local_dir.to_string_lossy(),
            dest.as_str(),
        ]))
        .await
        .map(|_| ())
    }

    async fn list_days(&self) -> Result<Vec<String>> {
        let listing = format!("{}/", self.root);
        let stdout = self.aws(args(["s3", "ls", listing.as_str()])).await?;
        // Common prefixes are printed as `PRE 2026-01-01/`
        Ok(stdout
            .lines()
            .filter_map(|line| line.trim().strip_prefix("PRE "))
            .map(|name| name.trim().trim_end_matches('/').to_string())
            .filter(|name| is_day_name(name))
            .collect())
    }

    async fn delete_day(&self, day: &str) -> Result<()> {
        let target = format!("{}/{}/", self.root, day);
        self.aws(args(["s3", "rm", "--recursive", "--only-show-errors", target.as_str()]))
            .await
            .map(|_| ())
    }
}
