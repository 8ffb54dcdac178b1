//! Digest-pinned image references.

use crate::utils::errors::{OpsError, Result};
use std::fmt;

const DIGEST_PREFIX: &str = "sha256:";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub repository: String,
    pub digest: String,
}

impl ImageRef {
    /// Parse `repo@sha256:<hex>` or a bare `sha256:<hex>`.
    ///
    /// A bare digest takes its repository from `default_repository`. Tags
    /// alone are refused: a rollout must name immutable content.
    pub fn parse(target: &str, default_repository: Option<&str>) -> Result<Self> {
        let target = target.trim();
        let (repository, digest) = match target.rsplit_once('@') {
            Some((repository, digest)) => (repository.to_string(), digest),
            None if target.starts_with(DIGEST_PREFIX) => {
                let repository = default_repository
                    .map(str::trim)
                    .filter(|r| !r.is_empty())
                    .ok_or_else(|| {
                        OpsError::Precondition(format!(
                            "bare digest {} given but no rollout repository is configured",
                            target
                        ))
                    })?;
                (repository.to_string(), target)
            }
            None => {
                return Err(OpsError::Precondition(format!(
                    "image {} is not pinned by digest",
                    target
                )))
            }
        };

        if repository.is_empty() {
            return Err(OpsError::Precondition(format!("image {} has no repository", target)));
        }
        validate_digest(digest)?;

        Ok(Self {
            // A tag in front of the digest is redundant and ignored by the runtime
            repository: strip_tag(&repository).to_string(),
            digest: digest.to_string(),
        })
    }
}

fn validate_digest(digest: &str) -> Result<()> {
    let hex = digest
        .strip_prefix(DIGEST_PREFIX)
        .ok_or_else(|| OpsError::Precondition(format!("unsupported digest {}", digest)))?;
    if hex.len() != 64 || !hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
        return Err(OpsError::Precondition(format!("malformed digest {}", digest)));
    }
    Ok(())
}

fn strip_tag(repository: &str) -> &str {
    // The tag separator is a colon after the last slash (a colon before it is a registry port)
    let name_start = repository.rfind('/').map(|i| i + 1).unwrap_or(0);
    match repository[name_start..].find(':') {
        Some(i) => &repository[..name_start + i],
        None => repository,
    }
}

impl fmt::Display for ImageRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repository, self.digest)
    }
}
