//! Directory traversal helpers.
//!
//! Used to locate structured data files inside a snapshot. Symlinks are
//! never followed: a snapshot must not reach outside its own root.

use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

/// Options for directory walking
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Only report files with one of these extensions (empty = all files)
    pub extensions: Vec<String>,
}

impl WalkOptions {
    pub fn with_extensions(extensions: &[&str]) -> Self {
        Self {
            extensions: extensions.iter().map(|e| e.to_string()).collect(),
        }
    }
}

/// Walk a directory tree and collect every regular file accepted by `options`,
/// in file-name order.
///
/// # Example
/// ```no_run
/// use tenantctl::fs::walker::{walk_files, WalkOptions};
/// use std::path::Path;
///
/// let dbs = walk_files(Path::new("/srv/backups/daily/2026-01-01"), &WalkOptions::with_extensions(&["db"])).unwrap();
/// println!("Found {} databases", dbs.len());
/// ```
pub fn walk_files(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(false).sort_by_file_name() {
        let entry = entry?;

        if !entry.file_type().is_file() || !matches_extension(&entry, &options.extensions) {
            continue;
        }
        files.push(entry.into_path());
    }

    Ok(files)
}

fn matches_extension(entry: &DirEntry, extensions: &[String]) -> bool {
    if extensions.is_empty() {
        return true;
    }
    entry
        .path()
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)))
        .unwrap_or(false)
}
