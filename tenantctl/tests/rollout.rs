mod common;

use common::*;
use std::sync::Arc;
use std::time::Duration;
use tenantctl::rollout::rollback::{RollbackManager, RollbackPlan};
use tenantctl::rollout::{RolloutController, RolloutRun, RolloutStatus, TenantOutcome};
use tenantctl::runtime::NetworkAttachment;
use tenantctl::tenant::archive_name;
use tenantctl::{Config, OpsError};
use tempfile::TempDir;

struct Fixture {
    _root: TempDir,
    config: Config,
    runtime: Arc<FakeRuntime>,
    health: Arc<FakeHealth>,
}

fn fixture(tenants: &[&str]) -> Fixture {
    let root = TempDir::new().unwrap();
    let config = test_config(root.path());
    let runtime = FakeRuntime::new();
    for tenant in tenants {
        seed_tenant(&config, tenant);
        runtime.add_tenant(tenant, OLD_IMAGE, true);
    }
    let health = FakeHealth::new(runtime.clone());
    Fixture {
        _root: root,
        config,
        runtime,
        health,
    }
}

impl Fixture {
    async fn rollout(&self, target: &str) -> tenantctl::Result<RolloutRun> {
        RolloutController::new(&self.config, self.runtime.clone(), monitor(self.health.clone()))
            .run(target)
            .await
    }

    fn data_dir(&self, tenant: &str) -> std::path::PathBuf {
        self.config.paths.tenants_root().join(tenant)
    }

    fn plan(&self, run: &RolloutRun, tenant: &str, original_id: &str) -> RollbackPlan {
        let container = format!("tenant-{}", tenant);
        RollbackPlan {
            run_id: run.run_id.clone(),
            tenant_id: tenant.into(),
            archive: archive_name(&container, &run.run_id),
            container,
            original_id: original_id.into(),
            data_dir: self.data_dir(tenant),
            snapshot: Some(self.config.paths.rollout_root.join(&run.run_id).join(tenant)),
        }
    }

    fn rollback_manager(&self) -> RollbackManager {
        RollbackManager::new(self.runtime.clone(), monitor(self.health.clone()), Duration::from_secs(1))
    }
}

#[tokio::test]
async fn all_healthy_commits_every_tenant() {
    let fx = fixture(&["t1", "t2"]);

    let run = fx.rollout(NEW_IMAGE).await.unwrap();

    assert_eq!(run.status, RolloutStatus::Completed);
    for tenant in ["t1", "t2"] {
        assert_eq!(run.tenant(tenant).unwrap().outcome, TenantOutcome::Committed);
        let container = fx.runtime.container(&format!("tenant-{}", tenant)).unwrap();
        assert_eq!(container.spec.image, NEW_IMAGE);
        assert!(container.running);
        assert_eq!(
            container.spec.networks,
            vec![NetworkAttachment::new(NETWORK, vec![tenant.to_string()])]
        );
        assert_eq!(container.spec.env, vec![format!("TENANT_ID={}", tenant)]);

        let archive = fx
            .runtime
            .container(&archive_name(&format!("tenant-{}", tenant), &run.run_id))
            .expect("archived container kept");
        assert_eq!(archive.spec.image, OLD_IMAGE);
        assert!(!archive.running);

        let snapshot = fx.config.paths.rollout_root.join(&run.run_id).join(tenant);
        assert_eq!(tree(&snapshot), tree(&fx.data_dir(tenant)));
    }

    let persisted = RolloutRun::load(&fx.config.paths.rollout_root, &run.run_id).unwrap();
    assert_eq!(persisted.status, RolloutStatus::Completed);
    assert_eq!(fx.runtime.mutations().iter().filter(|c| c.starts_with("pull")).count(), 1);
}

#[tokio::test]
async fn failing_second_tenant_is_rolled_back_and_halts() {
    let fx = fixture(&["t1", "t2", "t3"]);
    let t2_original = fx.runtime.container("tenant-t2").unwrap().id;
    fx.health.fail("tenant-t2", NEW_IMAGE);

    let run = fx.rollout(NEW_IMAGE).await.unwrap();

    assert!(run.is_halted());
    assert_eq!(run.tenant("t1").unwrap().outcome, TenantOutcome::Committed);
    assert_eq!(run.tenant("t2").unwrap().outcome, TenantOutcome::RolledBack);
    assert_eq!(run.tenant("t3").unwrap().outcome, TenantOutcome::Skipped);
    assert!(run.tenant("t2").unwrap().error.as_deref().unwrap_or("").contains("503"));

    assert_eq!(fx.runtime.container("tenant-t1").unwrap().spec.image, NEW_IMAGE);

    let t2 = fx.runtime.container("tenant-t2").unwrap();
    assert_eq!(t2.id, t2_original);
    assert_eq!(t2.spec.image, OLD_IMAGE);
    assert!(t2.running);
    assert!(fx
        .runtime
        .container(&archive_name("tenant-t2", &run.run_id))
        .is_none());

    assert!(fx.runtime.mutations_for("tenant-t3").is_empty());

    let persisted = RolloutRun::load(&fx.config.paths.rollout_root, &run.run_id).unwrap();
    assert_eq!(persisted.status, RolloutStatus::Halted);
    assert_eq!(persisted.tenant("t2").unwrap().outcome, TenantOutcome::RolledBack);
}

#[tokio::test]
async fn failed_canary_leaves_later_tenants_untouched() {
    let fx = fixture(&["a", "b", "c"]);
    fx.health.fail("tenant-a", NEW_IMAGE);
    let before_b = tree(&fx.data_dir("b"));
    let before_c = tree(&fx.data_dir("c"));

    let run = fx.rollout(NEW_IMAGE).await.unwrap();

    assert!(run.is_halted());
    assert_eq!(run.tenant("a").unwrap().outcome, TenantOutcome::RolledBack);
    for (tenant, before) in [("b", before_b), ("c", before_c)] {
        let name = format!("tenant-{}", tenant);
        assert!(fx.runtime.mutations_for(&name).is_empty(), "{} was touched", name);
        assert_eq!(fx.runtime.container(&name).unwrap().spec.image, OLD_IMAGE);
        assert_eq!(tree(&fx.data_dir(tenant)), before);
        assert!(!fx.config.paths.rollout_root.join(&run.run_id).join(tenant).exists());
    }
    assert!(fx.health.checks().iter().all(|p| p == "tenant-a"));
}

#[tokio::test]
async fn rollback_restores_data_byte_for_byte() {
    let fx = fixture(&["t1"]);
    let data_dir = fx.data_dir("t1");
    let before = tree(&data_dir);
    fx.health.fail("tenant-t1", NEW_IMAGE);
    fx.health.scribble_into(&data_dir);

    let run = fx.rollout(NEW_IMAGE).await.unwrap();

    assert_eq!(run.tenant("t1").unwrap().outcome, TenantOutcome::RolledBack);
    assert_eq!(tree(&data_dir), before);
    assert!(!data_dir.join("scribbled-by-new-release.txt").exists());
}

#[tokio::test]
async fn rollback_twice_changes_nothing() {
    let fx = fixture(&["t1"]);
    let original = fx.runtime.container("tenant-t1").unwrap().id;
    fx.health.fail("tenant-t1", NEW_IMAGE);
    fx.health.scribble_into(&fx.data_dir("t1"));

    let run = fx.rollout(NEW_IMAGE).await.unwrap();
    assert_eq!(run.tenant("t1").unwrap().outcome, TenantOutcome::RolledBack);

    let plan = fx.plan(&run, "t1", &original);
    let manager = fx.rollback_manager();
    let mutations_before = fx.runtime.mutations();
    let data_before = tree(&fx.data_dir("t1"));

    manager.rollback(&plan).await.unwrap();
    manager.rollback(&plan).await.unwrap();

    assert_eq!(fx.runtime.mutations(), mutations_before);
    assert_eq!(tree(&fx.data_dir("t1")), data_before);
    let container = fx.runtime.container("tenant-t1").unwrap();
    assert_eq!(container.id, original);
    assert!(container.running);
}

#[tokio::test]
async fn pull_failure_touches_no_tenant() {
    let fx = fixture(&["t1", "t2"]);
    fx.runtime.fail_pull();

    let err = fx.rollout(NEW_IMAGE).await.unwrap_err();

    assert!(matches!(err, OpsError::Runtime(_)));
    assert!(fx.runtime.mutations_for("tenant-t1").is_empty());
    assert!(fx.runtime.mutations_for("tenant-t2").is_empty());
}

#[tokio::test]
async fn unpinned_image_is_rejected_before_anything_runs() {
    let fx = fixture(&["t1"]);

    let err = fx.rollout("ghcr.io/acme/pulse:latest").await.unwrap_err();

    assert!(matches!(err, OpsError::Precondition(_)));
    assert!(fx.runtime.calls().is_empty());
}

#[tokio::test]
async fn bare_digest_uses_configured_repository() {
    let mut fx = fixture(&["t1"]);
    fx.config.rollout.repository = Some("ghcr.io/acme/pulse".into());
    let digest = NEW_IMAGE.split_once('@').unwrap().1;

    let run = fx.rollout(digest).await.unwrap();

    assert_eq!(run.image, NEW_IMAGE);
    assert_eq!(fx.runtime.container("tenant-t1").unwrap().spec.image, NEW_IMAGE);
}

#[tokio::test]
async fn recreated_container_keeps_every_network_and_only_its_own_settings() {
    let fx = fixture(&["t1"]);
    fx.runtime.attach("tenant-t1", "edge", &["t1.edge"]);
    fx.runtime.bake_image_defaults(
        OLD_IMAGE,
        &["PATH=/usr/local/bin:/usr/bin", "PULSE_VERSION=1.4.0"],
        &[("org.opencontainers.image.version", "1.4.0")],
    );

    let run = fx.rollout(NEW_IMAGE).await.unwrap();

    assert_eq!(run.tenant("t1").unwrap().outcome, TenantOutcome::Committed);
    let container = fx.runtime.container("tenant-t1").unwrap();
    assert_eq!(
        container.spec.networks,
        vec![
            NetworkAttachment::new(NETWORK, vec!["t1".to_string()]),
            NetworkAttachment::new("edge", vec!["t1.edge".to_string()]),
        ]
    );
    assert_eq!(container.spec.env, vec!["TENANT_ID=t1".to_string()]);
    assert_eq!(container.spec.labels.keys().collect::<Vec<_>>(), vec![LABEL]);
}

#[tokio::test]
async fn create_failure_puts_the_original_back() {
    let fx = fixture(&["t1", "t2"]);
    let original = fx.runtime.container("tenant-t1").unwrap().id;
    let before = tree(&fx.data_dir("t1"));
    fx.runtime.fail_create("tenant-t1");

    let run = fx.rollout(NEW_IMAGE).await.unwrap();

    assert!(run.is_halted());
    let record = run.tenant("t1").unwrap();
    assert_eq!(record.outcome, TenantOutcome::RolledBack);
    assert!(record.error.as_deref().unwrap_or("").contains("invalid mount"));
    assert_eq!(run.tenant("t2").unwrap().outcome, TenantOutcome::Skipped);

    let t1 = fx.runtime.container("tenant-t1").unwrap();
    assert_eq!(t1.id, original);
    assert_eq!(t1.spec.image, OLD_IMAGE);
    assert!(t1.running);
    assert!(fx.runtime.container(&archive_name("tenant-t1", &run.run_id)).is_none());
    assert_eq!(tree(&fx.data_dir("t1")), before);
    assert!(fx.runtime.mutations_for("tenant-t2").is_empty());
}

#[tokio::test]
async fn start_failure_removes_the_new_container() {
    let fx = fixture(&["t1"]);
    let original = fx.runtime.container("tenant-t1").unwrap().id;
    fx.runtime.fail_start("tenant-t1", NEW_IMAGE);

    let run = fx.rollout(NEW_IMAGE).await.unwrap();

    assert!(run.is_halted());
    assert_eq!(run.tenant("t1").unwrap().outcome, TenantOutcome::RolledBack);
    assert_eq!(fx.runtime.names(), vec!["tenant-t1"]);
    let t1 = fx.runtime.container("tenant-t1").unwrap();
    assert_eq!(t1.id, original);
    assert!(t1.running);
}

#[tokio::test]
async fn failed_rollback_is_recorded_and_can_be_finished_later() {
    let fx = fixture(&["t1", "t2"]);
    let original = fx.runtime.container("tenant-t1").unwrap().id;
    let before = tree(&fx.data_dir("t1"));
    fx.health.fail("tenant-t1", NEW_IMAGE);
    fx.health.scribble_into(&fx.data_dir("t1"));
    fx.runtime.fail_rename_to("tenant-t1");

    let run = fx.rollout(NEW_IMAGE).await.unwrap();

    assert!(run.is_halted());
    let record = run.tenant("t1").unwrap();
    assert_eq!(record.outcome, TenantOutcome::RollbackFailed);
    let error = record.error.as_deref().unwrap_or("");
    assert!(error.contains("503") && error.contains("cannot rename"), "{}", error);
    assert_eq!(run.tenant("t2").unwrap().outcome, TenantOutcome::Skipped);
    assert!(fx.runtime.mutations_for("tenant-t2").is_empty());
    let persisted = RolloutRun::load(&fx.config.paths.rollout_root, &run.run_id).unwrap();
    assert_eq!(persisted.tenant("t1").unwrap().outcome, TenantOutcome::RollbackFailed);
    assert!(fx.runtime.container("tenant-t1").is_none());
    assert!(fx.runtime.container(&archive_name("tenant-t1", &run.run_id)).is_some());

    fx.runtime.heal();
    fx.rollback_manager().rollback(&fx.plan(&run, "t1", &original)).await.unwrap();

    let t1 = fx.runtime.container("tenant-t1").unwrap();
    assert_eq!(t1.id, original);
    assert_eq!(t1.spec.image, OLD_IMAGE);
    assert!(t1.running);
    assert!(fx.runtime.container(&archive_name("tenant-t1", &run.run_id)).is_none());
    assert_eq!(tree(&fx.data_dir("t1")), before);
}

#[tokio::test]
async fn rollback_resumes_when_the_original_is_back_but_stopped() {
    let fx = fixture(&["t1"]);
    let original = fx.runtime.container("tenant-t1").unwrap().id;
    let before = tree(&fx.data_dir("t1"));
    fx.health.fail("tenant-t1", NEW_IMAGE);
    fx.health.scribble_into(&fx.data_dir("t1"));
    fx.runtime.fail_start("tenant-t1", OLD_IMAGE);

    let run = fx.rollout(NEW_IMAGE).await.unwrap();

    assert_eq!(run.tenant("t1").unwrap().outcome, TenantOutcome::RollbackFailed);
    let t1 = fx.runtime.container("tenant-t1").unwrap();
    assert_eq!(t1.id, original);
    assert!(!t1.running);

    fx.runtime.heal();
    let manager = fx.rollback_manager();
    let plan = fx.plan(&run, "t1", &original);
    manager.rollback(&plan).await.unwrap();
    let settled = fx.runtime.mutations();
    manager.rollback(&plan).await.unwrap();

    let t1 = fx.runtime.container("tenant-t1").unwrap();
    assert_eq!(t1.id, original);
    assert!(t1.running);
    assert_eq!(tree(&fx.data_dir("t1")), before);
    assert_eq!(fx.runtime.mutations(), settled);
}

#[tokio::test]
async fn stopped_tenant_is_left_as_it_was() {
    let fx = fixture(&["t1"]);
    seed_tenant(&fx.config, "t0");
    fx.runtime.add_tenant("t0", OLD_IMAGE, false);

    let run = fx.rollout(NEW_IMAGE).await.unwrap();

    assert_eq!(run.status, RolloutStatus::Completed);
    let record = run.tenant("t0").unwrap();
    assert_eq!(record.outcome, TenantOutcome::Skipped);
    assert!(record.error.is_some());
    assert!(fx.runtime.mutations_for("tenant-t0").is_empty());
    let t0 = fx.runtime.container("tenant-t0").unwrap();
    assert_eq!(t0.spec.image, OLD_IMAGE);
    assert!(!t0.running);
    assert_eq!(run.tenant("t1").unwrap().outcome, TenantOutcome::Committed);
}
