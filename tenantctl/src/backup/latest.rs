//! The `latest` reference.
//!
//! Every verified day is appended to an immutable history; the current value
//! is a single indirection record swapped atomically. On disk the history is
//! `<backup-root>/.latest-history.jsonl` and the record is the
//! `<backup-root>/latest` symlink, replaced with a rename.

use crate::utils::errors::{OpsError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

pub const LATEST_LINK: &str = "latest";
pub const HISTORY_FILE: &str = ".latest-history.jsonl";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LatestRecord {
    pub day: String,
    pub verified_at: DateTime<Utc>,
}

pub trait LatestStore: Send + Sync {
    /// Day the `latest` reference points at
    fn current(&self) -> Result<Option<String>>;

    /// Every published record, oldest first
    fn history(&self) -> Result<Vec<LatestRecord>>;

    /// Append `record` to the history and point `latest` at it.
    fn publish(&self, record: LatestRecord) -> Result<()>;
}

/// File-backed store living in the backup root
pub struct FileLatestStore {
    root: PathBuf,
}

impl FileLatestStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn history_path(&self) -> PathBuf {
        self.root.join(HISTORY_FILE)
    }
}

impl LatestStore for FileLatestStore {
    fn current(&self) -> Result<Option<String>> {
        match std::fs::read_link(self.root.join(LATEST_LINK)) {
            Ok(target) => Ok(target
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn history(&self) -> Result<Vec<LatestRecord>> {
        let content = match std::fs::read_to_string(self.history_path()) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| serde_json::from_str(line).map_err(OpsError::from))
            .collect()
    }

    fn publish(&self, record: LatestRecord) -> Result<()> {
        std::fs::create_dir_all(&self.root)?;

        let mut history = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.history_path())?;
        writeln!(history, "{}", serde_json::to_string(&record)?)?;
        history.sync_data()?;

        swap_link(&self.root, &record.day)
    }
}

/// Point `<root>/latest` at `day` via a temporary link and a rename.
fn swap_link(root: &Path, day: &str) -> Result<()> {
    let tmp = root.join(format!(".{}.{}", LATEST_LINK, std::process::id()));
    match std::fs::remove_file(&tmp) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    std::os::unix::fs::symlink(day, &tmp)?;
    std::fs::rename(&tmp, root.join(LATEST_LINK))?;
    Ok(())
}

/// In-process store for tests and dry runs
#[derive(Default)]
pub struct InMemoryLatestStore {
    records: Mutex<Vec<LatestRecord>>,
}

impl InMemoryLatestStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LatestStore for InMemoryLatestStore {
    fn current(&self) -> Result<Option<String>> {
        Ok(self.history()?.last().map(|r| r.day.clone()))
    }

    fn history(&self) -> Result<Vec<LatestRecord>> {
        self.records
            .lock()
            .map(|records| records.clone())
            .map_err(|_| OpsError::Precondition("latest store lock poisoned".into()))
    }

    fn publish(&self, record: LatestRecord) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| OpsError::Precondition("latest store lock poisoned".into()))?
            .push(record);
        Ok(())
    }
}
