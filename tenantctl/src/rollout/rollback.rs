//! Return a tenant to its pre-update state.

use crate::fs::mirror::{mirror_with, Compare};
use crate::rollout::health::HealthMonitor;
use crate::runtime::ContainerRuntime;
use crate::utils::errors::{OpsError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Everything needed to undo one tenant's update
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackPlan {
    pub run_id: String,
    pub tenant_id: String,
    /// Canonical container name
    pub container: String,
    pub original_id: String,
    pub archive: String,
    pub data_dir: PathBuf,
    /// Rollout snapshot, present only once it was completely written
    pub snapshot: Option<PathBuf>,
}

pub struct RollbackManager {
    runtime: Arc<dyn ContainerRuntime>,
    monitor: Arc<HealthMonitor>,
    stop_grace: Duration,
}

impl RollbackManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, monitor: Arc<HealthMonitor>, stop_grace: Duration) -> Self {
        Self {
            runtime,
            monitor,
            stop_grace,
        }
    }

    /// Restore the original container and data. Calling this again on a
    /// tenant that is already restored changes nothing.
    pub async fn rollback(&self, plan: &RollbackPlan) -> Result<()> {
        self.restore(plan)
            .await
            .map_err(|e| OpsError::Rollback(format!("tenant {}: {}", plan.tenant_id, e)))
    }

    async fn restore(&self, plan: &RollbackPlan) -> Result<()> {
        let canonical = self.runtime.inspect(&plan.container).await?;
        let archive = self.runtime.inspect(&plan.archive).await?;

        let canonical_is_original = canonical.as_ref().is_some_and(|c| c.id == plan.original_id);
        if archive.is_none() {
            match &canonical {
                Some(c) if canonical_is_original && c.running => {
                    info!(tenant = %plan.tenant_id, container = %plan.container, "Tenant already on its original container");
                    return Ok(());
                }
                Some(_) if canonical_is_original => {}
                _ => {
                    return Err(OpsError::Runtime(format!(
                        "original container {} is gone",
                        plan.original_id
                    )))
                }
            }
        }

        match &canonical {
            Some(c) if !canonical_is_original => {
                info!(tenant = %plan.tenant_id, container = %c.name, id = %c.id, "Removing updated container");
                self.runtime.remove(&plan.container).await?;
            }
            Some(c) if c.running && plan.snapshot.is_some() => {
                self.runtime.stop(&plan.container, self.stop_grace).await?;
            }
            _ => {}
        }

        if let Some(snapshot) = &plan.snapshot {
            let stats = mirror_with(snapshot, &plan.data_dir, Compare::Contents).await?;
            info!(
                tenant = %plan.tenant_id,
                restored = stats.files_copied,
                removed = stats.entries_removed,
                "Data directory restored from rollout snapshot"
            );
        }

        if archive.is_some() {
            self.runtime.rename(&plan.archive, &plan.container).await?;
        }

        let running = match self.runtime.inspect(&plan.container).await? {
            Some(c) => c.running,
            None => {
                return Err(OpsError::Runtime(format!(
                    "container {} missing after restore",
                    plan.container
                )))
            }
        };
        if !running {
            self.runtime.start(&plan.container).await?;
        }

        self.monitor.wait_healthy(&plan.container).await?;
        info!(tenant = %plan.tenant_id, run_id = %plan.run_id, "Rollback completed");
        Ok(())
    }
}
