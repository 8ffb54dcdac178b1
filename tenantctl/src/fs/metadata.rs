//! File metadata handling for mirror operations.
//!
//! Mirrors preserve mode bits, modification time and the raw numeric
//! ownership of every entry, so that a restored tree is indistinguishable
//! from the one that was copied.

use std::fs;
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::SystemTime;
use tracing::debug;

/// Metadata carried from a source entry to its mirror
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryMetadata {
    /// Permission bits including setuid/setgid/sticky
    pub mode: u32,

    /// Raw owner id
    pub uid: u32,

    /// Raw group id
    pub gid: u32,

    /// Last modification time, when the platform reports it
    pub modified: Option<SystemTime>,

    pub is_symlink: bool,
}

impl EntryMetadata {
    pub fn from_metadata(metadata: &fs::Metadata) -> Self {
        Self {
            mode: metadata.mode() & 0o7777,
            uid: metadata.uid(),
            gid: metadata.gid(),
            modified: metadata.modified().ok(),
            is_symlink: metadata.file_type().is_symlink(),
        }
    }

    /// Apply ownership, mtime and mode to `path`.
    ///
    /// Ownership changes that the current user is not allowed to make are
    /// skipped unless running as root, where they are errors.
    pub fn apply_to_path(&self, path: &Path) -> io::Result<()> {
        if let Err(e) = std::os::unix::fs::lchown(path, Some(self.uid), Some(self.gid)) {
            if e.kind() == io::ErrorKind::PermissionDenied && !running_as_root() {
                debug!(path = %path.display(), uid = self.uid, gid = self.gid, "Skipping ownership change without privileges");
            } else {
                return Err(e);
            }
        }

        // Symlink permissions and times are not meaningful on Linux
        if self.is_symlink {
            return Ok(());
        }

        if let Some(modified) = self.modified {
            match fs::File::open(path) {
                Ok(file) => file.set_times(fs::FileTimes::new().set_modified(modified))?,
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                    debug!(path = %path.display(), "Cannot open entry to set its mtime");
                }
                Err(e) => return Err(e),
            }
        }

        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(self.mode))?;

        Ok(())
    }
}

fn running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;
    use std::time::Duration;
    use tempfile::TempDir;

    fn read(path: &Path) -> io::Result<EntryMetadata> {
        Ok(EntryMetadata::from_metadata(&fs::symlink_metadata(path)?))
    }

    #[test]
    fn test_extract_metadata() -> io::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("state.json");
        fs::write(&path, b"{}")?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o640))?;

        let metadata = read(&path)?;

        assert_eq!(metadata.mode, 0o640);
        assert_eq!(metadata.uid, nix::unistd::geteuid().as_raw());
        assert!(metadata.modified.is_some());
        assert!(!metadata.is_symlink);

        Ok(())
    }

    #[test]
    fn test_apply_mode_and_mtime() -> io::Result<()> {
        let dir = TempDir::new()?;
        let source = dir.path().join("a");
        let target = dir.path().join("b");
        fs::write(&source, b"one")?;
        fs::write(&target, b"one")?;

        let past = SystemTime::now() - Duration::from_secs(86_400);
        fs::File::open(&source)?.set_times(fs::FileTimes::new().set_modified(past))?;
        fs::set_permissions(&source, fs::Permissions::from_mode(0o600))?;

        let metadata = read(&source)?;
        metadata.apply_to_path(&target)?;

        let applied = read(&target)?;
        assert_eq!(applied.mode, 0o600);
        assert_eq!(applied.modified, metadata.modified);

        Ok(())
    }
}
