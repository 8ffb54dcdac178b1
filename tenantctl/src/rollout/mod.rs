//! Canary-gated image rollouts.
//!
//! Tenants are updated one at a time in their fixed order; the first is the
//! canary. Each update is stop, snapshot, recreate on the new image, health check.
//! The first failure rolls that tenant back and halts the run, so no later
//! tenant is ever touched. The run record is rewritten after every step.

pub mod health;
pub mod image;
pub mod rollback;

use crate::config::Config;
use crate::fs::mirror::mirror;
use crate::runtime::{ContainerRuntime, ContainerSummary};
use crate::tenant::{self, archive_name, is_archive_name, Tenant};
use crate::utils::errors::{OpsError, Result};
use chrono::{DateTime, Utc};
use health::HealthMonitor;
use image::ImageRef;
use rollback::{RollbackManager, RollbackPlan};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

pub const RUN_RECORD: &str = "rollout.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RolloutStatus {
    Running,
    Completed,
    Halted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantStep {
    NotStarted,
    Stopping,
    Snapshotting,
    Recreating,
    HealthChecking,
    RollingBack,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TenantOutcome {
    Pending,
    Committed,
    RolledBack,
    RollbackFailed,
    /// Not attempted: the run halted earlier, or the container was already
    /// stopped and is left as it was
    Skipped,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TenantRecord {
    pub tenant_id: String,
    pub container: String,
    pub previous_image: String,
    pub step: TenantStep,
    pub outcome: TenantOutcome,
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutRun {
    pub run_id: String,
    pub image: String,
    pub status: RolloutStatus,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub tenants: Vec<TenantRecord>,
}

impl RolloutRun {
    pub fn is_halted(&self) -> bool {
        self.status == RolloutStatus::Halted
    }

    pub fn tenant(&self, id: &str) -> Option<&TenantRecord> {
        self.tenants.iter().find(|t| t.tenant_id == id)
    }

    /// Read a persisted run record.
    pub fn load(rollout_root: &Path, run_id: &str) -> Result<Self> {
        let content = std::fs::read_to_string(rollout_root.join(run_id).join(RUN_RECORD))?;
        Ok(serde_json::from_str(&content)?)
    }
}

/// `<UTC yyyymmddTHHMMSSZ>-<8 hex>`
pub fn new_run_id() -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("{}-{}", Utc::now().format("%Y%m%dT%H%M%SZ"), &suffix[..8])
}

/// Archived pre-rollout containers still held by the runtime
pub async fn archives(config: &Config, runtime: &dyn ContainerRuntime) -> Result<Vec<ContainerSummary>> {
    let mut archived: Vec<ContainerSummary> = runtime
        .list_by_label(&config.runtime.tenant_label)
        .await?
        .into_iter()
        .filter(|c| is_archive_name(&c.name))
        .collect();
    archived.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(archived)
}

pub struct RolloutController<'a> {
    config: &'a Config,
    runtime: Arc<dyn ContainerRuntime>,
    monitor: Arc<HealthMonitor>,
    rollback: RollbackManager,
}

impl<'a> RolloutController<'a> {
    pub fn new(config: &'a Config, runtime: Arc<dyn ContainerRuntime>, monitor: Arc<HealthMonitor>) -> Self {
        let rollback = RollbackManager::new(Arc::clone(&runtime), Arc::clone(&monitor), stop_grace(config));
        Self {
            config,
            runtime,
            monitor,
            rollback,
        }
    }

    /// Roll `target` (`repo@sha256:…` or a bare digest) out to every tenant.
    ///
    /// Returns the final run record; a halted run is `Ok` with
    /// [`RolloutStatus::Halted`]. Errors are failures before any tenant was
    /// touched.
    pub async fn run(&self, target: &str) -> Result<RolloutRun> {
        let image = ImageRef::parse(target, self.config.rollout.repository.as_deref())?;
        let image = image.to_string();

        let tenants: Vec<Tenant> = tenant::discover(self.config, self.runtime.as_ref())
            .await?
            .into_iter()
            .filter(|t| t.container.is_some())
            .collect();

        let run_id = new_run_id();
        let run_dir = self.config.paths.rollout_root.join(&run_id);
        tokio::fs::create_dir_all(&run_dir).await.map_err(|e| {
            OpsError::Precondition(format!("cannot create {}: {}", run_dir.display(), e))
        })?;

        let now = Utc::now();
        let mut run = RolloutRun {
            run_id: run_id.clone(),
            image: image.clone(),
            status: RolloutStatus::Running,
            started_at: now,
            finished_at: None,
            tenants: tenants
                .iter()
                .filter_map(|t| {
                    t.container.as_ref().map(|c| TenantRecord {
                        tenant_id: t.id.clone(),
                        container: c.name.clone(),
                        previous_image: c.image.clone(),
                        step: TenantStep::NotStarted,
                        outcome: TenantOutcome::Pending,
                        error: None,
                        updated_at: now,
                    })
                })
                .collect(),
        };
        info!(run_id = %run_id, image = %image, tenants = run.tenants.len(), "Starting rollout");
        persist(&run_dir, &run).await;

        if let Err(e) = self.runtime.pull(&image).await {
            error!(run_id = %run_id, image = %image, error = %e, "Image pull failed, no tenant touched");
            run.status = RolloutStatus::Halted;
            for record in &mut run.tenants {
                record.outcome = TenantOutcome::Skipped;
            }
            run.finished_at = Some(Utc::now());
            persist(&run_dir, &run).await;
            return Err(e);
        }

        let mut canary = true;
        for (index, tenant) in tenants.iter().enumerate() {
            let Some(container) = &tenant.container else {
                continue;
            };
            if !container.running {
                warn!(tenant = %tenant.id, container = %container.name, "Container not running, leaving it on its current image");
                run.tenants[index].outcome = TenantOutcome::Skipped;
                run.tenants[index].error = Some("container was not running".into());
                persist(&run_dir, &run).await;
                continue;
            }

            let mut plan = RollbackPlan {
                run_id: run_id.clone(),
                tenant_id: tenant.id.clone(),
                container: container.name.clone(),
                original_id: container.id.clone(),
                archive: archive_name(&container.name, &run_id),
                data_dir: tenant.data_dir.clone(),
                snapshot: None,
            };

            match self.update_tenant(&mut run, index, &mut plan, &image, &run_dir).await {
                Ok(()) => {
                    set_step(&mut run, index, TenantStep::Done);
                    run.tenants[index].outcome = TenantOutcome::Committed;
                    persist(&run_dir, &run).await;
                    info!(tenant = %tenant.id, canary, "Tenant committed to new image");
                    canary = false;
                }
                Err(e) => {
                    warn!(tenant = %tenant.id, step = ?run.tenants[index].step, error = %e, "Tenant update failed, rolling back");
                    run.tenants[index].error = Some(e.to_string());
                    set_step(&mut run, index, TenantStep::RollingBack);
                    persist(&run_dir, &run).await;

                    let outcome = match self.rollback.rollback(&plan).await {
                        Ok(()) => {
                            error!(tenant = %tenant.id, run_id = %run_id, alert = "rollout_halted", "Tenant rolled back, halting rollout");
                            TenantOutcome::RolledBack
                        }
                        Err(rollback_err) => {
                            error!(tenant = %tenant.id, run_id = %run_id, error = %rollback_err, alert = "rollback_failed", "Rollback failed, tenant needs manual recovery");
                            run.tenants[index].error = Some(format!("{}; {}", e, rollback_err));
                            TenantOutcome::RollbackFailed
                        }
                    };
                    run.tenants[index].outcome = outcome;
                    set_step(&mut run, index, TenantStep::Done);
                    for record in run.tenants.iter_mut().skip(index + 1) {
                        record.outcome = TenantOutcome::Skipped;
                    }
                    run.status = RolloutStatus::Halted;
                    break;
                }
            }
        }

        if run.status == RolloutStatus::Running {
            run.status = RolloutStatus::Completed;
        }
        run.finished_at = Some(Utc::now());
        persist(&run_dir, &run).await;
        info!(run_id = %run_id, status = ?run.status, "Rollout finished");
        Ok(run)
    }

    async fn update_tenant(
        &self,
        run: &mut RolloutRun,
        index: usize,
        plan: &mut RollbackPlan,
        image: &str,
        run_dir: &Path,
    ) -> Result<()> {
        self.transition(run, index, TenantStep::Stopping, run_dir).await;
        self.runtime.stop(&plan.container, stop_grace(self.config)).await?;

        self.transition(run, index, TenantStep::Snapshotting, run_dir).await;
        let snapshot: PathBuf = run_dir.join(&plan.tenant_id);
        let stats = mirror(&plan.data_dir, &snapshot).await?;
        plan.snapshot = Some(snapshot);
        info!(tenant = %plan.tenant_id, files = stats.files_copied, bytes = stats.bytes_copied, "Rollout snapshot taken");

        self.transition(run, index, TenantStep::Recreating, run_dir).await;
        let details = self.runtime.inspect(&plan.container).await?.ok_or_else(|| {
            OpsError::Runtime(format!("container {} disappeared", plan.container))
        })?;
        let defaults = self.runtime.image_config(&details.spec.image).await?;
        let mut spec = details.spec.without_image_defaults(&defaults);
        spec.image = image.to_string();
        self.runtime.rename(&plan.container, &plan.archive).await?;
        let new_id = self.runtime.create_attached(&plan.container, &spec).await?;
        self.runtime.start(&plan.container).await?;
        info!(tenant = %plan.tenant_id, archive = %plan.archive, id = %new_id, "Container recreated");

        self.transition(run, index, TenantStep::HealthChecking, run_dir).await;
        self.monitor.wait_healthy(&plan.container).await
    }

    async fn transition(&self, run: &mut RolloutRun, index: usize, step: TenantStep, run_dir: &Path) {
        set_step(run, index, step);
        persist(run_dir, run).await;
    }
}

fn stop_grace(config: &Config) -> Duration {
    Duration::from_secs(config.rollout.stop_grace_secs)
}

fn set_step(run: &mut RolloutRun, index: usize, step: TenantStep) {
    if let Some(record) = run.tenants.get_mut(index) {
        record.step = step;
        record.updated_at = Utc::now();
    }
}

/// Rewrite the run record. Failures are logged; the rollout carries on.
async fn persist(run_dir: &Path, run: &RolloutRun) {
    if let Err(e) = write_record(run_dir, run).await {
        warn!(run_id = %run.run_id, error = %e, "Failed to persist rollout record");
    }
}

async fn write_record(run_dir: &Path, run: &RolloutRun) -> Result<()> {
    let tmp = run_dir.join(format!(".{}.tmp", RUN_RECORD));
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(run)?).await?;
    tokio::fs::rename(&tmp, run_dir.join(RUN_RECORD)).await?;
    Ok(())
}
