//! Snapshot retention.
//!
//! Snapshot directories are named `YYYY-MM-DD`, so lexicographic order is
//! chronological order. Anything else in the backup root (the `latest`
//! link, history files) is never considered for deletion.

use crate::backup::remote::RemoteMirror;
use crate::utils::errors::Result;
use chrono::NaiveDate;
use std::path::Path;
use tracing::{info, warn};

pub const DAY_FORMAT: &str = "%Y-%m-%d";

pub fn is_day_name(name: &str) -> bool {
    name.len() == 10 && NaiveDate::parse_from_str(name, DAY_FORMAT).is_ok()
}

/// Names that fall outside the newest `retention` days, oldest first.
pub fn select_expired<I, S>(names: I, retention: usize) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let mut days: Vec<String> = names
        .into_iter()
        .map(Into::into)
        .filter(|name| is_day_name(name))
        .collect();
    days.sort();
    days.dedup();

    let excess = days.len().saturating_sub(retention);
    days.truncate(excess);
    days
}

/// Day directories present under `root`, sorted.
pub fn list_days(root: &Path) -> std::io::Result<Vec<String>> {
    let mut days = Vec::new();
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_day_name(&name) && entry.file_type()?.is_dir() {
            days.push(name);
        }
    }
    days.sort();
    Ok(days)
}

/// Delete local day directories beyond the retention count.
pub fn rotate_local(root: &Path, retention: usize) -> Result<Vec<String>> {
    let expired = select_expired(list_days(root)?, retention);
    for day in &expired {
        std::fs::remove_dir_all(root.join(day))?;
        info!(day = %day, "Removed expired local snapshot");
    }
    Ok(expired)
}

/// Delete remote days beyond the retention count. Failures are only logged.
pub async fn rotate_remote(mirror: &dyn RemoteMirror, retention: usize) -> Vec<String> {
    match mirror.rotate(retention).await {
        Ok(removed) => {
            for day in &removed {
                info!(backend = mirror.name(), day = %day, "Removed expired remote snapshot");
            }
            removed
        }
        Err(e) => {
            warn!(backend = mirror.name(), error = %e, "Remote rotation failed, continuing");
            Vec::new()
        }
    }
}
