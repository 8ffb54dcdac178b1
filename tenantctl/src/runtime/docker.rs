//! Docker CLI implementation of [`ContainerRuntime`].

use super::{
    CommandOutput, CommandRunner, ContainerDetails, ContainerRuntime, ContainerSpec,
    ContainerSummary, ImageConfig, Inventory, Mount, MountKind, NetworkAttachment,
};
use crate::runtime::command::args;
use crate::utils::errors::{OpsError, Result};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub struct DockerCli {
    binary: String,
    runner: Arc<dyn CommandRunner>,
}

impl DockerCli {
    pub fn new(binary: impl Into<String>, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            binary: binary.into(),
            runner,
        }
    }

    async fn raw(&self, argv: Vec<String>) -> Result<CommandOutput> {
        self.runner.run(&self.binary, &argv).await
    }

    /// Run a docker subcommand, turning a non-zero exit into a runtime error.
    async fn docker(&self, argv: Vec<String>) -> Result<String> {
        let subcommand = argv.first().cloned().unwrap_or_default();
        let output = self.raw(argv).await?;
        if !output.success() {
            return Err(OpsError::Runtime(format!(
                "{} {} failed: {}",
                self.binary,
                subcommand,
                output.stderr.trim()
            )));
        }
        Ok(output.stdout)
    }
}

#[async_trait]
impl ContainerRuntime for DockerCli {
    async fn list_by_label(&self, label: &str) -> Result<Vec<ContainerSummary>> {
        let filter = format!("label={}", label);
        let format = ps_format(label)?;
        let stdout = self
            .docker(args([
                "ps",
                "-a",
                "--no-trunc",
                "--filter",
                filter.as_str(),
                "--format",
                format.as_str(),
            ]))
            .await?;

        stdout
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| -> Result<ContainerSummary> {
                let row: PsRow = serde_json::from_str(line)?;
                Ok(row.into_summary())
            })
            .collect()
    }

    async fn inspect(&self, name: &str) -> Result<Option<ContainerDetails>> {
        let output = self
            .raw(args(["inspect", "--type", "container", name]))
            .await?;
        if !output.success() {
            if output.stderr.contains("No such") {
                return Ok(None);
            }
            return Err(OpsError::Runtime(format!(
                "{} inspect {} failed: {}",
                self.binary,
                name,
                output.stderr.trim()
            )));
        }

        let mut parsed: Vec<InspectDoc> = serde_json::from_str(&output.stdout)?;
        Ok(parsed.pop().map(InspectDoc::into_details))
    }

    async fn pause(&self, name: &str) -> Result<()> {
        self.docker(args(["pause", name])).await.map(|_| ())
    }

    async fn unpause(&self, name: &str) -> Result<()> {
        self.docker(args(["unpause", name])).await.map(|_| ())
    }

    async fn stop(&self, name: &str, grace: Duration) -> Result<()> {
        let secs = grace.as_secs().to_string();
        self.docker(args(["stop", "--time", secs.as_str(), name])).await.map(|_| ())
    }

    async fn start(&self, name: &str) -> Result<()> {
        self.docker(args(["start", name])).await.map(|_| ())
    }

    async fn remove(&self, name: &str) -> Result<()> {
        self.docker(args(["rm", "--force", name])).await.map(|_| ())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        self.docker(args(["rename", from, to])).await.map(|_| ())
    }

    async fn pull(&self, image: &str) -> Result<()> {
        info!(image, "Pulling image");
        self.docker(args(["pull", "--quiet", image])).await.map(|_| ())
    }

    async fn create(&self, name: &str, spec: &ContainerSpec) -> Result<String> {
        let stdout = self.docker(create_args(name, spec)).await?;
        let id = stdout.trim().to_string();
        debug!(name, id = %id, "Container created");
        Ok(id)
    }

    async fn network_connect(&self, name: &str, network: &str, aliases: &[String]) -> Result<()> {
        let mut argv = args(["network", "connect"]);
        for alias in aliases {
            argv.push("--alias".into());
            argv.push(alias.clone());
        }
        argv.push(network.to_string());
        argv.push(name.to_string());
        self.docker(argv).await?;
        debug!(name, network, "Container attached to network");
        Ok(())
    }

    async fn image_config(&self, image: &str) -> Result<ImageConfig> {
        let stdout = self
            .docker(args(["image", "inspect", "--format", "{{json .Config}}", image]))
            .await?;
        let doc: ImageConfigDoc = serde_json::from_str(stdout.trim())?;
        Ok(ImageConfig {
            env: doc.env.unwrap_or_default(),
            labels: doc.labels.unwrap_or_default(),
        })
    }

    async fn exec(&self, name: &str, command: &[String]) -> Result<String> {
        let mut argv = args(["exec", name]);
        argv.extend(command.iter().cloned());
        self.docker(argv).await
    }

    async fn inventory(&self) -> Result<Inventory> {
        let containers = self
            .docker(args([
                "ps",
                "-a",
                "--format",
                "{{.Names}}\t{{.Image}}\t{{.State}}\t{{.Status}}",
            ]))
            .await?;
        let images = self
            .docker(args([
                "images",
                "--digests",
                "--format",
                "{{.Repository}}:{{.Tag}}\t{{.Digest}}\t{{.ID}}",
            ]))
            .await?;
        Ok(Inventory { containers, images })
    }
}

/// Arguments for `docker create` that reproduce `spec` under `name`.
pub fn create_args(name: &str, spec: &ContainerSpec) -> Vec<String> {
    let mut argv = args(["create", "--name", name]);

    for env in &spec.env {
        argv.push("--env".into());
        argv.push(env.clone());
    }
    for (key, value) in &spec.labels {
        argv.push("--label".into());
        argv.push(format!("{}={}", key, value));
    }
    for mount in &spec.mounts {
        let kind = match mount.kind {
            MountKind::Bind => "bind",
            MountKind::Volume => "volume",
        };
        let mut value = format!("type={},source={},target={}", kind, mount.source, mount.target);
        if mount.read_only {
            value.push_str(",readonly");
        }
        argv.push("--mount".into());
        argv.push(value);
    }
    // Further networks are attached with `network connect` before start
    if let Some(first) = spec.networks.first() {
        argv.push("--network".into());
        argv.push(first.network.clone());
        for alias in &first.aliases {
            argv.push("--network-alias".into());
            argv.push(alias.clone());
        }
    }
    if let Some(policy) = &spec.restart_policy {
        argv.push("--restart".into());
        argv.push(policy.clone());
    }
    if let Some(user) = &spec.user {
        argv.push("--user".into());
        argv.push(user.clone());
    }

    argv.push(spec.image.clone());
    argv
}

/// `docker ps` template emitting one JSON object per container, with the
/// value of `label` looked up directly rather than from the comma-joined
/// `.Labels` column, whose values may themselves contain commas.
fn ps_format(label: &str) -> Result<String> {
    let key = serde_json::to_string(label)?;
    Ok(format!(
        r#"{{"ID":{{{{json .ID}}}},"Names":{{{{json .Names}}}},"Image":{{{{json .Image}}}},"State":{{{{json .State}}}},"Label":{{{{json (.Label {})}}}}}}"#,
        key
    ))
}

#[derive(Deserialize)]
struct PsRow {
    #[serde(rename = "ID")]
    id: String,
    #[serde(rename = "Names")]
    names: String,
    #[serde(rename = "Image")]
    image: String,
    #[serde(rename = "State")]
    state: String,
    #[serde(rename = "Label", default)]
    label: String,
}

impl PsRow {
    fn into_summary(self) -> ContainerSummary {
        ContainerSummary {
            id: self.id,
            name: self.names.split(',').next().unwrap_or_default().to_string(),
            image: self.image,
            running: self.state == "running",
            label_value: self.label,
        }
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ImageConfigDoc {
    #[serde(default)]
    env: Option<Vec<String>>,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectDoc {
    id: String,
    name: String,
    state: InspectState,
    config: InspectConfig,
    host_config: InspectHostConfig,
    #[serde(default)]
    mounts: Vec<InspectMount>,
    network_settings: InspectNetworkSettings,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    running: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    image: String,
    #[serde(default)]
    env: Option<Vec<String>>,
    #[serde(default)]
    labels: Option<BTreeMap<String, String>>,
    #[serde(default)]
    user: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectHostConfig {
    #[serde(default)]
    restart_policy: Option<InspectRestartPolicy>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectRestartPolicy {
    name: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectMount {
    #[serde(rename = "Type")]
    kind: String,
    #[serde(default)]
    name: Option<String>,
    source: String,
    destination: String,
    #[serde(rename = "RW")]
    rw: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectNetworkSettings {
    #[serde(default)]
    networks: BTreeMap<String, InspectEndpoint>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectEndpoint {
    #[serde(rename = "IPAddress", default)]
    ip_address: String,
    #[serde(default)]
    aliases: Option<Vec<String>>,
}

impl InspectDoc {
    fn into_details(self) -> ContainerDetails {
        let short_id: String = self.id.chars().take(12).collect();
        let name = self.name.trim_start_matches('/').to_string();

        let mounts = self
            .mounts
            .into_iter()
            .filter_map(|m| {
                let (kind, source) = match m.kind.as_str() {
                    "bind" => (MountKind::Bind, m.source),
                    "volume" => (MountKind::Volume, m.name.unwrap_or(m.source)),
                    _ => return None,
                };
                Some(Mount {
                    kind,
                    source,
                    target: m.destination,
                    read_only: !m.rw,
                })
            })
            .collect();

        let mut addresses = BTreeMap::new();
        let mut networks = Vec::new();
        for (net_name, endpoint) in self.network_settings.networks {
            if let Ok(ip) = endpoint.ip_address.parse::<IpAddr>() {
                addresses.insert(net_name.clone(), ip);
            }
            // Docker adds the name and short id itself
            let aliases = endpoint
                .aliases
                .unwrap_or_default()
                .into_iter()
                .filter(|a| *a != short_id && *a != name)
                .collect();
            networks.push(NetworkAttachment::new(net_name, aliases));
        }

        let restart_policy = self
            .host_config
            .restart_policy
            .map(|p| p.name)
            .filter(|p| !p.is_empty() && p != "no");

        ContainerDetails {
            id: self.id,
            running: self.state.running,
            spec: ContainerSpec {
                image: self.config.image,
                env: self.config.env.unwrap_or_default(),
                labels: self.config.labels.unwrap_or_default(),
                mounts,
                networks,
                restart_policy,
                user: Some(self.config.user).filter(|u| !u.is_empty()),
            },
            addresses,
            name,
        }
    }
}
