//! Restore drills.
//!
//! A drill proves that a snapshot is restorable without touching live state:
//! one tenant's copy is restored into a scratch directory, its databases are
//! verified, and optionally a throwaway container is started on the restored
//! data and health checked.

use crate::backup::integrity::{self, IntegrityStatus};
use crate::backup::latest::{FileLatestStore, LatestStore};
use crate::backup::retention::is_day_name;
use crate::backup::TENANTS_DIR;
use crate::config::Config;
use crate::fs::mirror::{mirror, MirrorStats};
use crate::rollout::health::HealthMonitor;
use crate::runtime::{ContainerRuntime, ContainerSpec, Mount, NetworkAttachment};
use crate::tenant::{is_archive_name, validate_tenant_id};
use crate::utils::errors::{OpsError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub const LATEST_DAY: &str = "latest";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrillRequest {
    /// `YYYY-MM-DD` or `latest`
    pub day: String,
    pub tenant: String,
    /// Leave the scratch copy in place afterwards
    pub keep: bool,
    pub start_instance: bool,
}

impl DrillRequest {
    pub fn latest(tenant: impl Into<String>) -> Self {
        Self {
            day: LATEST_DAY.to_string(),
            tenant: tenant.into(),
            keep: false,
            start_instance: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceReport {
    pub container: String,
    pub image: String,
    pub healthy: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DrillReport {
    pub day: String,
    pub tenant: String,
    pub scratch_dir: PathBuf,
    pub restored: MirrorStats,
    pub integrity: Vec<IntegrityStatus>,
    pub instance: Option<InstanceReport>,
    pub kept: bool,
}

impl DrillReport {
    pub fn passed(&self) -> bool {
        self.integrity.iter().all(|s| s.ok) && self.instance.as_ref().map_or(true, |i| i.healthy)
    }
}

pub struct DrillRunner<'a> {
    config: &'a Config,
    runtime: Arc<dyn ContainerRuntime>,
    latest: Arc<dyn LatestStore>,
    monitor: Option<Arc<HealthMonitor>>,
}

impl<'a> DrillRunner<'a> {
    pub fn new(config: &'a Config, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self {
            config,
            runtime,
            latest: Arc::new(FileLatestStore::new(&config.paths.backup_root)),
            monitor: None,
        }
    }

    pub fn with_latest_store(mut self, latest: Arc<dyn LatestStore>) -> Self {
        self.latest = latest;
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<HealthMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Map `latest` to a concrete day and reject anything that is not a day.
    pub fn resolve_day(&self, day: &str) -> Result<String> {
        let day = if day == LATEST_DAY {
            self.latest
                .current()?
                .ok_or_else(|| OpsError::Precondition("no verified snapshot published yet".into()))?
        } else {
            day.to_string()
        };
        if !is_day_name(&day) {
            return Err(OpsError::Precondition(format!("{:?} is not a snapshot day", day)));
        }
        Ok(day)
    }

    pub async fn drill(&self, request: &DrillRequest) -> Result<DrillReport> {
        validate_tenant_id(&request.tenant)?;
        let day = self.resolve_day(&request.day)?;

        let source = self
            .config
            .paths
            .backup_root
            .join(&day)
            .join(TENANTS_DIR)
            .join(&request.tenant);
        if !source.is_dir() {
            return Err(OpsError::Precondition(format!(
                "snapshot {} has no copy of tenant {}",
                day, request.tenant
            )));
        }

        let token = Uuid::new_v4().simple().to_string()[..8].to_string();
        let scratch = self
            .config
            .paths
            .scratch_root
            .join(format!("drill-{}-{}-{}", day, request.tenant, token));
        info!(tenant = %request.tenant, day = %day, scratch = %scratch.display(), "Starting restore drill");

        let outcome = self.restore_and_verify(request, &day, &source, &scratch, &token).await;

        if !request.keep {
            if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(scratch = %scratch.display(), error = %e, "Failed to remove drill scratch copy");
                }
            }
        }

        let report = outcome?;
        if report.passed() {
            info!(tenant = %report.tenant, day = %report.day, "Restore drill passed");
        } else {
            error!(tenant = %report.tenant, day = %report.day, alert = "restore_drill_failed", "Restore drill failed");
        }
        Ok(report)
    }

    async fn restore_and_verify(
        &self,
        request: &DrillRequest,
        day: &str,
        source: &Path,
        scratch: &Path,
        token: &str,
    ) -> Result<DrillReport> {
        let restored = mirror(source, scratch).await?;
        let report = integrity::verify(scratch).await?;

        let instance = if request.start_instance {
            Some(self.verify_instance(&request.tenant, scratch, token).await)
        } else {
            None
        };

        Ok(DrillReport {
            day: day.to_string(),
            tenant: request.tenant.clone(),
            scratch_dir: scratch.to_path_buf(),
            restored,
            integrity: report.statuses,
            instance,
            kept: request.keep,
        })
    }

    /// Start a throwaway container on the restored data and health check it.
    async fn verify_instance(&self, tenant: &str, scratch: &Path, token: &str) -> InstanceReport {
        let name = format!("tenantctl-drill-{}-{}", tenant, token);
        let mut report = InstanceReport {
            container: name.clone(),
            image: String::new(),
            healthy: false,
            error: None,
        };

        let spec = match self.instance_spec(tenant, scratch).await {
            Ok(spec) => spec,
            Err(e) => {
                report.error = Some(e.to_string());
                return report;
            }
        };
        report.image = spec.image.clone();

        if let Err(e) = self.runtime.create_attached(&name, &spec).await {
            report.error = Some(e.to_string());
            return report;
        }

        let checked = match self.runtime.start(&name).await {
            Ok(()) => match self.monitor() {
                Ok(monitor) => monitor.wait_healthy(&name).await,
                Err(e) => Err(e),
            },
            Err(e) => Err(e),
        };
        match checked {
            Ok(()) => report.healthy = true,
            Err(e) => report.error = Some(e.to_string()),
        }

        if let Err(e) = self.runtime.remove(&name).await {
            error!(container = %name, error = %e, "Failed to remove drill container");
        } else {
            debug!(container = %name, "Drill container removed");
        }
        report
    }

    /// Configured image, or the tenant's current image, plus the environment
    /// set on the tenant's container.
    async fn instance_spec(&self, tenant: &str, scratch: &Path) -> Result<ContainerSpec> {
        let label = &self.config.runtime.tenant_label;
        let current = self
            .runtime
            .list_by_label(label)
            .await?
            .into_iter()
            .find(|c| !is_archive_name(&c.name) && c.label_value == tenant);

        let (image, env) = match &current {
            Some(container) => {
                let env = match self.runtime.inspect(&container.name).await? {
                    Some(details) => {
                        let defaults = self.runtime.image_config(&details.spec.image).await?;
                        details.spec.without_image_defaults(&defaults).env
                    }
                    None => Vec::new(),
                };
                (container.image.clone(), env)
            }
            None => (String::new(), Vec::new()),
        };
        let image = self.config.drill.image.clone().unwrap_or(image);
        if image.is_empty() {
            return Err(OpsError::Precondition(format!(
                "no drill image configured and tenant {} has no container",
                tenant
            )));
        }

        let mut labels = BTreeMap::new();
        labels.insert(format!("{}-drill", label), tenant.to_string());

        Ok(ContainerSpec {
            image,
            env,
            labels,
            mounts: vec![Mount::bind(scratch, self.config.drill.data_mount.clone())],
            networks: vec![NetworkAttachment::new(self.config.runtime.network.clone(), Vec::new())],
            restart_policy: None,
            user: None,
        })
    }

    fn monitor(&self) -> Result<Arc<HealthMonitor>> {
        match &self.monitor {
            Some(monitor) => Ok(Arc::clone(monitor)),
            None => Ok(Arc::new(HealthMonitor::from_config(self.config, Arc::clone(&self.runtime))?)),
        }
    }
}
