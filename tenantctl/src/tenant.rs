//! Tenant discovery.
//!
//! A tenant is a directory under the tenants root. Its container is the one
//! whose tenant label carries the directory name. Archived pre-rollout
//! containers keep their labels and are filtered out here.

use crate::config::Config;
use crate::runtime::{ContainerRuntime, ContainerSummary};
use crate::utils::errors::{OpsError, Result};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tracing::warn;

/// Marker inserted into the name of an archived pre-rollout container
pub const ARCHIVE_MARKER: &str = ".pre-rollout-";

/// The container currently serving a tenant
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerRef {
    pub name: String,
    pub id: String,
    pub image: String,
    pub running: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tenant {
    pub id: String,
    pub data_dir: PathBuf,
    pub container: Option<ContainerRef>,
}

impl Tenant {
    pub fn running_container(&self) -> Option<&ContainerRef> {
        self.container.as_ref().filter(|c| c.running)
    }
}

/// Name given to a container archived by rollout `run_id`
pub fn archive_name(container: &str, run_id: &str) -> String {
    format!("{}{}{}", container, ARCHIVE_MARKER, run_id)
}

pub fn is_archive_name(name: &str) -> bool {
    name.contains(ARCHIVE_MARKER)
}

/// Reject ids that could escape the directory they are joined onto.
pub fn validate_tenant_id(id: &str) -> Result<()> {
    if id.is_empty() || id == "." || id == ".." || id.contains('/') || id.contains('\0') {
        return Err(OpsError::Precondition(format!("invalid tenant id {:?}", id)));
    }
    Ok(())
}

/// List tenants in their fixed, stable order (sorted by id).
pub async fn discover(config: &Config, runtime: &dyn ContainerRuntime) -> Result<Vec<Tenant>> {
    let tenants_root = config.paths.tenants_root();
    if !tenants_root.is_dir() {
        return Err(OpsError::Precondition(format!(
            "tenants root {} is not a directory",
            tenants_root.display()
        )));
    }

    let mut ids = Vec::new();
    for entry in std::fs::read_dir(&tenants_root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            ids.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    ids.sort();

    let label = &config.runtime.tenant_label;
    let mut by_tenant: BTreeMap<String, ContainerSummary> = BTreeMap::new();
    for container in runtime.list_by_label(label).await? {
        if is_archive_name(&container.name) {
            continue;
        }
        if container.label_value.is_empty() {
            continue;
        }
        let tenant_id = container.label_value.clone();
        match by_tenant.get(&tenant_id) {
            Some(existing) => {
                warn!(tenant = %tenant_id, kept = %existing.name, ignored = %container.name, "Multiple containers labelled for one tenant");
                if container.running && !existing.running {
                    by_tenant.insert(tenant_id, container);
                }
            }
            None => {
                by_tenant.insert(tenant_id, container);
            }
        }
    }

    let tenants: Vec<Tenant> = ids
        .into_iter()
        .map(|id| {
            let container = by_tenant.remove(&id).map(|c| ContainerRef {
                name: c.name,
                id: c.id,
                image: c.image,
                running: c.running,
            });
            Tenant {
                data_dir: tenants_root.join(&id),
                id,
                container,
            }
        })
        .collect();

    for orphan in by_tenant.keys() {
        warn!(tenant = %orphan, "Container labelled for a tenant without a data directory");
    }

    Ok(tenants)
}
