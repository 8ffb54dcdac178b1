#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::net::{IpAddr, Ipv4Addr};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tenantctl::backup::remote::RemoteMirror;
use tenantctl::rollout::health::{HealthCheck, HealthMonitor};
use tenantctl::runtime::{
    ContainerDetails, ContainerRuntime, ContainerSpec, ContainerSummary, ImageConfig, Inventory, NetworkAttachment,
};
use tenantctl::{Config, OpsError, Result};

pub const LABEL: &str = "io.tenantctl.tenant";
pub const NETWORK: &str = "tenants";
pub const OLD_IMAGE: &str =
    "ghcr.io/acme/pulse@sha256:1111111111111111111111111111111111111111111111111111111111111111";
pub const NEW_IMAGE: &str =
    "ghcr.io/acme/pulse@sha256:2222222222222222222222222222222222222222222222222222222222222222";

#[derive(Debug, Clone)]
pub struct FakeContainer {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub paused: bool,
    pub spec: ContainerSpec,
}

#[derive(Default)]
struct FakeState {
    containers: Vec<FakeContainer>,
    calls: Vec<String>,
    created: Vec<(String, ContainerSpec)>,
    fail_pause: HashSet<String>,
    fail_pull: bool,
    fail_create: HashSet<String>,
    fail_start: HashSet<(String, String)>,
    fail_rename_to: HashSet<String>,
    image_configs: BTreeMap<String, ImageConfig>,
    next_id: u32,
}

/// In-memory container runtime recording every call
#[derive(Default)]
pub struct FakeRuntime {
    state: Mutex<FakeState>,
}

impl FakeRuntime {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Add the container `tenant-<id>` serving tenant `id`.
    pub fn add_tenant(&self, tenant: &str, image: &str, running: bool) -> String {
        let mut labels = BTreeMap::new();
        labels.insert(LABEL.to_string(), tenant.to_string());
        let spec = ContainerSpec {
            image: image.to_string(),
            env: vec![format!("TENANT_ID={}", tenant)],
            labels,
            mounts: Vec::new(),
            networks: vec![NetworkAttachment::new(NETWORK, vec![tenant.to_string()])],
            restart_policy: Some("unless-stopped".to_string()),
            user: None,
        };
        let mut state = self.state.lock().unwrap();
        let id = next_id(&mut state);
        state.containers.push(FakeContainer {
            id: id.clone(),
            name: format!("tenant-{}", tenant),
            running,
            paused: false,
            spec,
        });
        id
    }

    pub fn fail_pause(&self, name: &str) {
        self.state.lock().unwrap().fail_pause.insert(name.to_string());
    }

    pub fn fail_pull(&self) {
        self.state.lock().unwrap().fail_pull = true;
    }

    /// Creating a container called `name` fails.
    pub fn fail_create(&self, name: &str) {
        self.state.lock().unwrap().fail_create.insert(name.to_string());
    }

    /// Starting `name` fails while it runs `image`.
    pub fn fail_start(&self, name: &str, image: &str) {
        self.state
            .lock()
            .unwrap()
            .fail_start
            .insert((name.to_string(), image.to_string()));
    }

    /// Renaming any container to `name` fails.
    pub fn fail_rename_to(&self, name: &str) {
        self.state.lock().unwrap().fail_rename_to.insert(name.to_string());
    }

    /// Clear every injected failure.
    pub fn heal(&self) {
        let mut state = self.state.lock().unwrap();
        state.fail_pause.clear();
        state.fail_pull = false;
        state.fail_create.clear();
        state.fail_start.clear();
        state.fail_rename_to.clear();
    }

    /// Attach container `name` to one more network.
    pub fn attach(&self, name: &str, network: &str, aliases: &[&str]) {
        let aliases = aliases.iter().map(|a| a.to_string()).collect();
        self.with_container(name, |c| {
            c.spec.networks.push(NetworkAttachment::new(network, aliases));
            Ok(())
        })
        .unwrap();
    }

    /// Give `image` baked-in env and labels, and show them on every
    /// container already running it, the way `docker inspect` does.
    pub fn bake_image_defaults(&self, image: &str, env: &[&str], labels: &[(&str, &str)]) {
        let config = ImageConfig {
            env: env.iter().map(|e| e.to_string()).collect(),
            labels: labels.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        };
        let mut state = self.state.lock().unwrap();
        for container in state.containers.iter_mut().filter(|c| c.spec.image == image) {
            let mut env = config.env.clone();
            env.append(&mut container.spec.env);
            container.spec.env = env;
            for (key, value) in &config.labels {
                container.spec.labels.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
        state.image_configs.insert(image.to_string(), config);
    }

    pub fn container(&self, name: &str) -> Option<FakeContainer> {
        self.state.lock().unwrap().containers.iter().find(|c| c.name == name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().unwrap().containers.iter().map(|c| c.name.clone()).collect();
        names.sort();
        names
    }

    pub fn paused(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .containers
            .iter()
            .filter(|c| c.paused)
            .map(|c| c.name.clone())
            .collect()
    }

    /// Every call as `"<op> <name>"`
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls that change container state
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| {
                !c.starts_with("inspect")
                    && !c.starts_with("list")
                    && !c.starts_with("inventory")
                    && !c.starts_with("image_config")
            })
            .collect()
    }

    /// Calls naming `name`, ignoring read-only ones
    pub fn mutations_for(&self, name: &str) -> Vec<String> {
        self.mutations()
            .into_iter()
            .filter(|c| c.split_whitespace().skip(1).any(|arg| arg == name || arg.starts_with(&format!("{}.", name))))
            .collect()
    }

    pub fn created(&self) -> Vec<(String, ContainerSpec)> {
        self.state.lock().unwrap().created.clone()
    }

    fn record(&self, call: String) {
        self.state.lock().unwrap().calls.push(call);
    }

    fn with_container<T>(&self, name: &str, f: impl FnOnce(&mut FakeContainer) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock().unwrap();
        match state.containers.iter_mut().find(|c| c.name == name) {
            Some(container) => f(container),
            None => Err(OpsError::Runtime(format!("No such container: {}", name))),
        }
    }
}

fn next_id(state: &mut FakeState) -> String {
    state.next_id += 1;
    format!("{:064x}", state.next_id)
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn list_by_label(&self, label: &str) -> Result<Vec<ContainerSummary>> {
        self.record(format!("list {}", label));
        let state = self.state.lock().unwrap();
        Ok(state
            .containers
            .iter()
            .filter(|c| c.spec.labels.contains_key(label))
            .map(|c| ContainerSummary {
                id: c.id.clone(),
                name: c.name.clone(),
                image: c.spec.image.clone(),
                running: c.running,
                label_value: c.spec.labels.get(label).cloned().unwrap_or_default(),
            })
            .collect())
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerDetails>> {
        self.record(format!("inspect {}", name));
        let state = self.state.lock().unwrap();
        Ok(state.containers.iter().enumerate().find(|(_, c)| c.name == name).map(|(i, c)| {
            let addresses = c
                .spec
                .networks
                .iter()
                .enumerate()
                .map(|(n, attachment)| {
                    let ip = IpAddr::V4(Ipv4Addr::new(10, n as u8, 0, i as u8 + 2));
                    (attachment.network.clone(), ip)
                })
                .collect();
            ContainerDetails {
                id: c.id.clone(),
                name: c.name.clone(),
                running: c.running,
                spec: c.spec.clone(),
                addresses,
            }
        }))
    }

    async fn pause(&self, name: &str) -> Result<()> {
        self.record(format!("pause {}", name));
        if self.state.lock().unwrap().fail_pause.contains(name) {
            return Err(OpsError::Runtime(format!("cannot pause {}", name)));
        }
        self.with_container(name, |c| {
            c.paused = true;
            Ok(())
        })
    }

    async fn unpause(&self, name: &str) -> Result<()> {
        self.record(format!("unpause {}", name));
        self.with_container(name, |c| {
            c.paused = false;
            Ok(())
        })
    }

    async fn stop(&self, name: &str, _grace: Duration) -> Result<()> {
        self.record(format!("stop {}", name));
        self.with_container(name, |c| {
            c.running = false;
            Ok(())
        })
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.record(format!("start {}", name));
        let failing = self.state.lock().unwrap().fail_start.clone();
        self.with_container(name, |c| {
            if failing.contains(&(c.name.clone(), c.spec.image.clone())) {
                return Err(OpsError::Runtime(format!("cannot start {}: exec format error", name)));
            }
            c.running = true;
            Ok(())
        })
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.record(format!("remove {}", name));
        let mut state = self.state.lock().unwrap();
        let before = state.containers.len();
        state.containers.retain(|c| c.name != name);
        if state.containers.len() == before {
            return Err(OpsError::Runtime(format!("No such container: {}", name)));
        }
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.record(format!("rename {} {}", from, to));
        if self.state.lock().unwrap().fail_rename_to.contains(to) {
            return Err(OpsError::Runtime(format!("cannot rename {} to {}", from, to)));
        }
        if self.container(to).is_some() {
            return Err(OpsError::Runtime(format!("name {} already in use", to)));
        }
        self.with_container(from, |c| {
            c.name = to.to_string();
            Ok(())
        })
    }

    async fn pull(&self, image: &str) -> Result<()> {
        self.record(format!("pull {}", image));
        if self.state.lock().unwrap().fail_pull {
            return Err(OpsError::Runtime(format!("manifest unknown: {}", image)));
        }
        Ok(())
    }

    async fn create(&self, name: &str, spec: &ContainerSpec) -> Result<String> {
        self.record(format!("create {}", name));
        let mut state = self.state.lock().unwrap();
        if state.fail_create.contains(name) {
            return Err(OpsError::Runtime(format!("cannot create {}: invalid mount", name)));
        }
        if state.containers.iter().any(|c| c.name == name) {
            return Err(OpsError::Runtime(format!("name {} already in use", name)));
        }
        // Like `docker create`, only the first network is attached
        let mut attached = spec.clone();
        attached.networks.truncate(1);
        let id = next_id(&mut state);
        state.containers.push(FakeContainer {
            id: id.clone(),
            name: name.to_string(),
            running: false,
            paused: false,
            spec: attached,
        });
        state.created.push((name.to_string(), spec.clone()));
        Ok(id)
    }

    async fn network_connect(&self, name: &str, network: &str, aliases: &[String]) -> Result<()> {
        self.record(format!("connect {} {}", name, network));
        self.with_container(name, |c| {
            if c.spec.networks.iter().any(|n| n.network == network) {
                return Err(OpsError::Runtime(format!("{} already attached to {}", name, network)));
            }
            c.spec.networks.push(NetworkAttachment::new(network, aliases.to_vec()));
            Ok(())
        })
    }

    async fn image_config(&self, image: &str) -> Result<ImageConfig> {
        self.record(format!("image_config {}", image));
        Ok(self
            .state
            .lock()
            .unwrap()
            .image_configs
            .get(image)
            .cloned()
            .unwrap_or_default())
    }

    async fn exec(&self, name: &str, _command: &[String]) -> Result<String> {
        self.record(format!("exec {}", name));
        Ok(String::new())
    }

    async fn inventory(&self) -> Result<Inventory> {
        self.record("inventory".to_string());
        let state = self.state.lock().unwrap();
        let containers = state
            .containers
            .iter()
            .map(|c| format!("{}\t{}\t{}\n", c.name, c.spec.image, if c.running { "Up" } else { "Exited" }))
            .collect();
        let images: BTreeSet<&str> = state.containers.iter().map(|c| c.spec.image.as_str()).collect();
        Ok(Inventory {
            containers,
            images: images.into_iter().map(|i| format!("{}\n", i)).collect(),
        })
    }
}

/// Health check answering from the fake runtime's state.
///
/// A container is healthy when it is running, unless its (name, image) pair
/// was marked failing. Probing a failing container scribbles into
/// `scribble_dir`, standing in for a broken release damaging tenant data.
/// One of the damaged files keeps its size and mtime.
pub struct FakeHealth {
    runtime: Arc<FakeRuntime>,
    failing: Mutex<HashSet<(String, String)>>,
    scribble_dir: Mutex<Option<PathBuf>>,
    checks: Mutex<Vec<String>>,
}

impl FakeHealth {
    pub fn new(runtime: Arc<FakeRuntime>) -> Arc<Self> {
        Arc::new(Self {
            runtime,
            failing: Mutex::new(HashSet::new()),
            scribble_dir: Mutex::new(None),
            checks: Mutex::new(Vec::new()),
        })
    }

    pub fn fail(&self, container: &str, image: &str) {
        self.failing.lock().unwrap().insert((container.to_string(), image.to_string()));
    }

    pub fn scribble_into(&self, dir: &Path) {
        *self.scribble_dir.lock().unwrap() = Some(dir.to_path_buf());
    }

    pub fn checks(&self) -> Vec<String> {
        self.checks.lock().unwrap().clone()
    }
}

#[async_trait]
impl HealthCheck for FakeHealth {
    async fn check(&self, container: &str) -> Result<()> {
        self.checks.lock().unwrap().push(container.to_string());
        let Some(c) = self.runtime.container(container) else {
            return Err(OpsError::HealthCheck(format!("{} not found", container)));
        };
        if !c.running {
            return Err(OpsError::HealthCheck(format!("{} not running", container)));
        }
        let failing = self
            .failing
            .lock()
            .unwrap()
            .contains(&(container.to_string(), c.spec.image.clone()));
        if failing {
            if let Some(dir) = self.scribble_dir.lock().unwrap().clone() {
                std::fs::write(dir.join("scribbled-by-new-release.txt"), b"junk")?;
                std::fs::write(dir.join("notes.txt"), b"overwritten by the new release, longer than before")?;
                let logo = dir.join("uploads/logo.svg");
                let mtime = std::fs::metadata(&logo)?.modified()?;
                std::fs::write(&logo, b"<bad/>")?;
                std::fs::File::open(&logo)?.set_times(std::fs::FileTimes::new().set_modified(mtime))?;
            }
            return Err(OpsError::HealthCheck(format!("{} returned 503", container)));
        }
        Ok(())
    }
}

pub fn monitor(health: Arc<FakeHealth>) -> Arc<HealthMonitor> {
    Arc::new(HealthMonitor::new(health, 3, Duration::from_millis(1), Duration::from_millis(2)))
}

/// Remote mirror keeping its days in memory
#[derive(Default)]
pub struct MemoryMirror {
    pub days: Mutex<BTreeSet<String>>,
    pub calls: Mutex<Vec<String>>,
    pub fail_sync: bool,
}

impl MemoryMirror {
    pub fn failing() -> Self {
        Self {
            fail_sync: true,
            ..Self::default()
        }
    }

    pub fn days(&self) -> Vec<String> {
        self.days.lock().unwrap().iter().cloned().collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteMirror for MemoryMirror {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn sync(&self, day: &str, local_dir: &Path) -> Result<()> {
        self.calls.lock().unwrap().push(format!("sync {}", day));
        if self.fail_sync {
            return Err(OpsError::RemoteSync("remote unreachable".into()));
        }
        assert!(local_dir.join("meta/run.json").is_file());
        self.days.lock().unwrap().insert(day.to_string());
        Ok(())
    }

    async fn list_days(&self) -> Result<Vec<String>> {
        self.calls.lock().unwrap().push("list".into());
        Ok(self.days())
    }

    async fn delete_day(&self, day: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("delete {}", day));
        self.days.lock().unwrap().remove(day);
        Ok(())
    }
}

/// Config rooted in a temporary directory
pub fn test_config(root: &Path) -> Config {
    let mut config = Config::default();
    config.paths.data_root = root.join("platform");
    config.paths.backup_root = root.join("backups/daily");
    config.paths.rollout_root = root.join("backups/rollout");
    config.paths.scratch_root = root.join("backups/scratch");
    config.backup.metrics_file = root.join("textfile/tenant_backup.prom");
    config.backup.retention = 2;
    config.runtime.tenant_label = LABEL.to_string();
    config.runtime.network = NETWORK.to_string();
    std::fs::create_dir_all(config.paths.control_plane_root().join("state")).unwrap();
    std::fs::write(config.paths.control_plane_root().join("state/registry.json"), b"{\"tenants\":3}").unwrap();
    make_db(&config.paths.control_plane_root().join("control.sqlite3"));
    config
}

/// Create a tenant data directory with a database and a few plain files.
pub fn seed_tenant(config: &Config, tenant: &str) -> PathBuf {
    let dir = config.paths.tenants_root().join(tenant);
    std::fs::create_dir_all(dir.join("uploads")).unwrap();
    make_db(&dir.join("pulse.db"));
    std::fs::write(dir.join("notes.txt"), format!("tenant {}", tenant)).unwrap();
    std::fs::write(dir.join("uploads/logo.svg"), b"<svg/>").unwrap();
    std::fs::set_permissions(dir.join("notes.txt"), std::fs::Permissions::from_mode(0o640)).unwrap();
    dir
}

pub fn make_db(path: &Path) {
    let conn = rusqlite::Connection::open(path).unwrap();
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS events (id INTEGER PRIMARY KEY, kind TEXT NOT NULL);
         INSERT INTO events (kind) VALUES ('signup'), ('login');",
    )
    .unwrap();
}

/// Relative path -> (contents, mode) for every file and directory below `root`
pub fn tree(root: &Path) -> BTreeMap<PathBuf, (Vec<u8>, u32)> {
    walkdir::WalkDir::new(root)
        .min_depth(1)
        .into_iter()
        .map(|entry| {
            let entry = entry.unwrap();
            let metadata = entry.metadata().unwrap();
            let contents = if metadata.is_file() {
                std::fs::read(entry.path()).unwrap()
            } else {
                Vec::new()
            };
            (
                entry.path().strip_prefix(root).unwrap().to_path_buf(),
                (contents, metadata.permissions().mode()),
            )
        })
        .collect()
}
