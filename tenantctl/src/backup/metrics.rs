//! Prometheus textfile for backup runs.
//!
//! Rewritten exactly once per run, whatever the outcome, so that a missing
//! or stale timestamp is itself an alerting signal.

use crate::backup::BackupRunResult;
use crate::utils::errors::Result;
use std::io::Write;
use std::path::PathBuf;
use tracing::debug;

pub const SUCCESS_GAUGE: &str = "tenant_backup_last_success";
pub const TIMESTAMP_GAUGE: &str = "tenant_backup_last_run_timestamp_seconds";

pub struct MetricsPublisher {
    path: PathBuf,
}

impl MetricsPublisher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn render(result: &BackupRunResult) -> String {
        format!(
            "# HELP {success} Whether the last backup run succeeded (1) or failed (0).\n\
             # TYPE {success} gauge\n\
             {success} {value}\n\
             # HELP {ts} Completion time of the last backup run.\n\
             # TYPE {ts} gauge\n\
             {ts} {timestamp}\n",
            success = SUCCESS_GAUGE,
            ts = TIMESTAMP_GAUGE,
            value = u8::from(result.success),
            timestamp = result.completed_at.timestamp(),
        )
    }

    /// Write the gauges atomically (temp file + rename) so the collector
    /// never reads a partial file.
    pub fn publish(&self, result: &BackupRunResult) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut tmp_name = self.path.clone().into_os_string();
        tmp_name.push(".tmp");
        let tmp = PathBuf::from(tmp_name);

        let mut file = std::fs::File::create(&tmp)?;
        file.write_all(Self::render(result).as_bytes())?;
        file.sync_all()?;
        std::fs::rename(&tmp, &self.path)?;

        debug!(path = %self.path.display(), success = result.success, "Metrics written");
        Ok(())
    }
}
