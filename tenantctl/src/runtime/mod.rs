//! Container runtime control surface.
//!
//! The pipelines only ever talk to containers through [`ContainerRuntime`].
//! [`docker::DockerCli`] is the production implementation.

pub mod command;
pub mod docker;

use crate::utils::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

pub use command::{CommandOutput, CommandRunner, SystemRunner};
pub use docker::DockerCli;

/// One row of a label-filtered container listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSummary {
    pub id: String,
    pub name: String,
    pub image: String,
    pub running: bool,
    /// Value of the label the listing was filtered on
    pub label_value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MountKind {
    Bind,
    Volume,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mount {
    pub kind: MountKind,
    /// Host path for binds, volume name for volumes
    pub source: String,
    pub target: String,
    pub read_only: bool,
}

impl Mount {
    pub fn bind(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            kind: MountKind::Bind,
            source: source.into().to_string_lossy().into_owned(),
            target: target.into(),
            read_only: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkAttachment {
    pub network: String,
    pub aliases: Vec<String>,
}

impl NetworkAttachment {
    pub fn new(network: impl Into<String>, aliases: Vec<String>) -> Self {
        Self {
            network: network.into(),
            aliases,
        }
    }
}

/// Environment and labels baked into an image
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageConfig {
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
}

/// Everything needed to recreate a container with a different image
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    pub env: Vec<String>,
    pub labels: BTreeMap<String, String>,
    pub mounts: Vec<Mount>,
    /// Every attached network; the first is the one given at creation
    pub networks: Vec<NetworkAttachment>,
    pub restart_policy: Option<String>,
    pub user: Option<String>,
}

impl ContainerSpec {
    /// Keep only the environment and labels that were set on the container
    /// itself, dropping entries identical to `image`'s own defaults.
    pub fn without_image_defaults(mut self, image: &ImageConfig) -> Self {
        self.env.retain(|entry| !image.env.contains(entry));
        self.labels
            .retain(|key, value| image.labels.get(key) != Some(value));
        self
    }
}

/// Result of inspecting one container
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerDetails {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub spec: ContainerSpec,
    /// IP address per attached network
    pub addresses: BTreeMap<String, IpAddr>,
}

/// Point-in-time listing of containers and images, recorded with each snapshot
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Inventory {
    pub containers: String,
    pub images: String,
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// All containers (running or not) carrying `label`
    async fn list_by_label(&self, label: &str) -> Result<Vec<ContainerSummary>>;

    /// `None` when no container has this name
    async fn inspect(&self, name: &str) -> Result<Option<ContainerDetails>>;

    async fn pause(&self, name: &str) -> Result<()>;

    async fn unpause(&self, name: &str) -> Result<()>;

    /// Stop, killing the container once `grace` has elapsed
    async fn stop(&self, name: &str, grace: Duration) -> Result<()>;

    async fn start(&self, name: &str) -> Result<()>;

    /// Force-remove a container
    async fn remove(&self, name: &str) -> Result<()>;

    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    async fn pull(&self, image: &str) -> Result<()>;

    /// Create (without starting) a container on the first of `spec`'s
    /// networks, returning its id
    async fn create(&self, name: &str, spec: &ContainerSpec) -> Result<String>;

    /// Attach an existing container to one more network
    async fn network_connect(&self, name: &str, network: &str, aliases: &[String]) -> Result<()>;

    async fn image_config(&self, image: &str) -> Result<ImageConfig>;

    /// Run a command inside a running container and return its stdout
    async fn exec(&self, name: &str, command: &[String]) -> Result<String>;

    async fn inventory(&self) -> Result<Inventory>;

    /// Create a container and attach it to every network in `spec`.
    async fn create_attached(&self, name: &str, spec: &ContainerSpec) -> Result<String> {
        let id = self.create(name, spec).await?;
        for attachment in spec.networks.iter().skip(1) {
            self.network_connect(name, &attachment.network, &attachment.aliases)
                .await?;
        }
        Ok(id)
    }

    /// Address of `name` on `network`
    async fn address(&self, name: &str, network: &str) -> Result<Option<IpAddr>> {
        Ok(self
            .inspect(name)
            .await?
            .and_then(|details| details.addresses.get(network).copied()))
    }
}
