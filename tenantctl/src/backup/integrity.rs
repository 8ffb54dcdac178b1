//! Structured data integrity checks.
//!
//! Every SQLite database in a snapshot is opened read-only and asked for
//! `PRAGMA quick_check`. The only acceptable answer is the single row `ok`.

use crate::fs::walker::{walk_files, WalkOptions};
use crate::utils::errors::{OpsError, Result};
use rusqlite::{Connection, OpenFlags};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{error, info};

/// Extensions treated as structured data files
pub const STRUCTURED_EXTENSIONS: &[&str] = &["db", "sqlite", "sqlite3"];

/// Outcome of checking one file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IntegrityStatus {
    pub path: PathBuf,
    pub ok: bool,
    /// The check's result string, or the error that prevented it
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub statuses: Vec<IntegrityStatus>,
}

impl IntegrityReport {
    pub fn first_failure(&self) -> Option<&IntegrityStatus> {
        self.statuses.iter().find(|s| !s.ok)
    }

    /// Turn the first failed file into an integrity error.
    pub fn ensure_ok(&self) -> Result<()> {
        match self.first_failure() {
            Some(failed) => Err(OpsError::integrity(&failed.path, &failed.detail)),
            None => Ok(()),
        }
    }
}

/// Run `PRAGMA quick_check` against one database without modifying it.
pub fn check_file(path: &Path) -> IntegrityStatus {
    let detail = match quick_check(path) {
        Ok(rows) => rows.join("; "),
        Err(e) => format!("error: {}", e),
    };

    IntegrityStatus {
        path: path.to_path_buf(),
        ok: detail == "ok",
        detail,
    }
}

fn quick_check(path: &Path) -> rusqlite::Result<Vec<String>> {
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )?;
    let mut stmt = conn.prepare("PRAGMA quick_check")?;
    let rows = stmt.query_map([], |row| row.get::<_, String>(0))?;
    rows.collect()
}

/// Check every structured data file below `root`.
pub fn verify_tree(root: &Path) -> Result<IntegrityReport> {
    let files = walk_files(root, &WalkOptions::with_extensions(STRUCTURED_EXTENSIONS))?;

    let mut report = IntegrityReport::default();
    for file in files {
        let status = check_file(&file);
        if status.ok {
            info!(path = %status.path.display(), "Integrity check passed");
        } else {
            error!(path = %status.path.display(), detail = %status.detail, "Integrity check failed");
        }
        report.statuses.push(status);
    }

    Ok(report)
}

/// [`verify_tree`] on a blocking thread.
pub async fn verify(root: &Path) -> Result<IntegrityReport> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || verify_tree(&root)).await?
}
