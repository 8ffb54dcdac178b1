//! Byte-for-byte directory mirroring.
//!
//! `mirror_tree(src, dst)` makes `dst` an exact copy of `src`: new and changed
//! files are copied, entries that exist only in `dst` are removed, and every
//! entry carries the source's mode, mtime and numeric ownership. A file whose
//! size and mtime already match is left alone, unless the pass runs with
//! [`Compare::Contents`], which also requires identical bytes.

use crate::fs::metadata::EntryMetadata;
use crate::utils::errors::{OpsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use tracing::debug;
use walkdir::WalkDir;

/// What a mirror pass did
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MirrorStats {
    pub files_copied: usize,
    pub bytes_copied: u64,
    pub files_unchanged: usize,
    pub entries_removed: usize,
}

/// How an existing destination file is judged up to date
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Compare {
    /// Same size and mtime
    #[default]
    SizeAndMtime,
    /// Same size, mtime and bytes
    Contents,
}

/// Mirror `src` into `dst` on a blocking thread.
pub async fn mirror(src: &Path, dst: &Path) -> Result<MirrorStats> {
    mirror_with(src, dst, Compare::SizeAndMtime).await
}

pub async fn mirror_with(src: &Path, dst: &Path, compare: Compare) -> Result<MirrorStats> {
    let src = src.to_path_buf();
    let dst = dst.to_path_buf();
    tokio::task::spawn_blocking(move || mirror_tree_with(&src, &dst, compare)).await?
}

/// Mirror `src` into `dst`, creating `dst` if needed.
pub fn mirror_tree(src: &Path, dst: &Path) -> Result<MirrorStats> {
    mirror_tree_with(src, dst, Compare::SizeAndMtime)
}

pub fn mirror_tree_with(src: &Path, dst: &Path, compare: Compare) -> Result<MirrorStats> {
    let root_meta = fs::symlink_metadata(src).map_err(|e| OpsError::copy(src, e))?;
    if !root_meta.is_dir() {
        return Err(OpsError::copy(
            src,
            io::Error::new(io::ErrorKind::InvalidInput, "mirror source is not a directory"),
        ));
    }
    fs::create_dir_all(dst).map_err(|e| OpsError::copy(dst, e))?;

    let mut stats = MirrorStats::default();
    let mut seen: HashSet<PathBuf> = HashSet::new();
    let mut dirs: Vec<(PathBuf, EntryMetadata)> = Vec::new();

    for entry in WalkDir::new(src).follow_links(false).min_depth(1).sort_by_file_name() {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(src).to_path_buf();
            OpsError::copy(path, io::Error::from(e))
        })?;
        let rel = entry.path().strip_prefix(src).unwrap_or(entry.path()).to_path_buf();
        let target = dst.join(&rel);
        let metadata = entry.metadata().map_err(|e| OpsError::copy(entry.path(), e.into()))?;
        let file_type = metadata.file_type();

        let result = if file_type.is_dir() {
            mirror_dir(&target).map(|()| {
                dirs.push((target.clone(), EntryMetadata::from_metadata(&metadata)));
            })
        } else if file_type.is_file() {
            mirror_file(entry.path(), &target, &metadata, compare, &mut stats)
        } else if file_type.is_symlink() {
            mirror_symlink(entry.path(), &target, &metadata, &mut stats)
        } else {
            debug!(path = %entry.path().display(), "Skipping special file");
            continue;
        };
        result.map_err(|e| OpsError::copy(entry.path(), e))?;
        seen.insert(rel);
    }

    stats.entries_removed = remove_extraneous(dst, &seen)?;

    // Directory mtimes change while children are written, so they go last,
    // deepest first.
    dirs.push((dst.to_path_buf(), EntryMetadata::from_metadata(&root_meta)));
    for (dir, metadata) in dirs.iter().rev() {
        metadata
            .apply_to_path(dir)
            .map_err(|e| OpsError::copy(dir, e))?;
    }

    Ok(stats)
}

fn mirror_dir(target: &Path) -> io::Result<()> {
    match fs::symlink_metadata(target) {
        Ok(existing) if existing.is_dir() => return Ok(()),
        Ok(_) => fs::remove_file(target)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::create_dir(target)
}

fn mirror_file(
    source: &Path,
    target: &Path,
    metadata: &fs::Metadata,
    compare: Compare,
    stats: &mut MirrorStats,
) -> io::Result<()> {
    let source_meta = EntryMetadata::from_metadata(metadata);

    match fs::symlink_metadata(target) {
        Ok(existing) if existing.is_file() => {
            let quick_match =
                existing.len() == metadata.len() && existing.modified().ok() == source_meta.modified;
            let unchanged = quick_match
                && match compare {
                    Compare::SizeAndMtime => true,
                    Compare::Contents => same_contents(source, target)?,
                };
            if unchanged {
                stats.files_unchanged += 1;
                return source_meta.apply_to_path(target);
            }
        }
        Ok(existing) => remove_any(target, &existing)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    // Copy next to the target and rename over it so a reader never sees a
    // half-written file.
    let tmp = temp_sibling(target);
    let copied = fs::copy(source, &tmp)?;
    if let Err(e) = source_meta.apply_to_path(&tmp).and_then(|()| fs::rename(&tmp, target)) {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }

    stats.files_copied += 1;
    stats.bytes_copied += copied;
    Ok(())
}

fn mirror_symlink(
    source: &Path,
    target: &Path,
    metadata: &fs::Metadata,
    stats: &mut MirrorStats,
) -> io::Result<()> {
    let link = fs::read_link(source)?;

    match fs::symlink_metadata(target) {
        Ok(existing) if existing.file_type().is_symlink() && fs::read_link(target)? == link => {
            stats.files_unchanged += 1;
            return EntryMetadata::from_metadata(metadata).apply_to_path(target);
        }
        Ok(existing) => remove_any(target, &existing)?,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    std::os::unix::fs::symlink(&link, target)?;
    EntryMetadata::from_metadata(metadata).apply_to_path(target)?;
    stats.files_copied += 1;
    Ok(())
}

fn remove_extraneous(dst: &Path, seen: &HashSet<PathBuf>) -> Result<usize> {
    let mut removed = 0;
    let mut walker = WalkDir::new(dst).follow_links(false).min_depth(1).into_iter();

    while let Some(entry) = walker.next() {
        let entry = entry.map_err(|e| OpsError::copy(dst, io::Error::from(e)))?;
        let rel = entry.path().strip_prefix(dst).unwrap_or(entry.path());
        if seen.contains(rel) {
            continue;
        }

        let result = if entry.file_type().is_dir() {
            walker.skip_current_dir();
            fs::remove_dir_all(entry.path())
        } else {
            fs::remove_file(entry.path())
        };
        result.map_err(|e| OpsError::copy(entry.path(), e))?;
        debug!(path = %entry.path().display(), "Removed entry absent from source");
        removed += 1;
    }

    Ok(removed)
}

fn same_contents(a: &Path, b: &Path) -> io::Result<bool> {
    let mut a = io::BufReader::new(fs::File::open(a)?);
    let mut b = io::BufReader::new(fs::File::open(b)?);
    loop {
        let chunk_a = a.fill_buf()?;
        let chunk_b = b.fill_buf()?;
        if chunk_a.is_empty() || chunk_b.is_empty() {
            return Ok(chunk_a.is_empty() && chunk_b.is_empty());
        }
        let n = chunk_a.len().min(chunk_b.len());
        if chunk_a[..n] != chunk_b[..n] {
            return Ok(false);
        }
        a.consume(n);
        b.consume(n);
    }
}

fn remove_any(path: &Path, existing: &fs::Metadata) -> io::Result<()> {
    if existing.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    }
}

fn temp_sibling(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    target.with_file_name(format!(".{}.tenantctl-partial", name))
}
