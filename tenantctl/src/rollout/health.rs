//! Tenant health probing.
//!
//! A [`HealthCheck`] makes one attempt against a container's internal
//! address. [`HealthMonitor`] retries it with exponential backoff until the
//! attempt budget is spent.

use crate::config::Config;
use crate::runtime::ContainerRuntime;
use crate::utils::errors::{OpsError, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

#[async_trait]
pub trait HealthCheck: Send + Sync {
    /// One check of `container`. `Ok` means healthy.
    async fn check(&self, container: &str) -> Result<()>;
}

/// Resolve `http://<internal-ip>:<port><path>` for a container.
async fn health_url(
    runtime: &dyn ContainerRuntime,
    container: &str,
    network: &str,
    port: u16,
    path: &str,
) -> Result<String> {
    let ip = runtime.address(container, network).await?.ok_or_else(|| {
        OpsError::HealthCheck(format!("{} has no address on network {}", container, network))
    })?;
    let host = match ip {
        std::net::IpAddr::V4(v4) => v4.to_string(),
        std::net::IpAddr::V6(v6) => format!("[{}]", v6),
    };
    Ok(format!("http://{}:{}{}", host, port, path))
}

/// GET the health endpoint from this host.
pub struct HttpHealthCheck {
    runtime: Arc<dyn ContainerRuntime>,
    client: reqwest::Client,
    network: String,
    port: u16,
    path: String,
}

impl HttpHealthCheck {
    pub fn new(config: &Config, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(config.health.request_timeout_ms))
            .build()
            .map_err(|e| OpsError::Config(format!("cannot build HTTP client: {}", e)))?;

        Ok(Self {
            runtime,
            client,
            network: config.runtime.network.clone(),
            port: config.health.port,
            path: config.health.path.clone(),
        })
    }
}

#[async_trait]
impl HealthCheck for HttpHealthCheck {
    async fn check(&self, container: &str) -> Result<()> {
        let url = health_url(self.runtime.as_ref(), container, &self.network, self.port, &self.path).await?;
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| OpsError::HealthCheck(format!("{}: {}", url, e)))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(OpsError::HealthCheck(format!("{} returned {}", url, response.status())))
        }
    }
}

/// Fetch the health endpoint from inside a helper container on the private
/// network, for hosts that cannot route to it.
pub struct ExecHealthCheck {
    runtime: Arc<dyn ContainerRuntime>,
    check_container: String,
    network: String,
    port: u16,
    path: String,
    timeout_secs: u64,
}

impl ExecHealthCheck {
    pub fn new(config: &Config, runtime: Arc<dyn ContainerRuntime>, check_container: String) -> Self {
        Self {
            runtime,
            check_container,
            network: config.runtime.network.clone(),
            port: config.health.port,
            path: config.health.path.clone(),
            timeout_secs: config.health.request_timeout_ms.div_ceil(1000).max(1),
        }
    }
}

#[async_trait]
impl HealthCheck for ExecHealthCheck {
    async fn check(&self, container: &str) -> Result<()> {
        let url = health_url(self.runtime.as_ref(), container, &self.network, self.port, &self.path).await?;
        let command = vec![
            "wget".to_string(),
            "-q".to_string(),
            "-O-".to_string(),
            format!("--timeout={}", self.timeout_secs),
            url.clone(),
        ];
        self.runtime
            .exec(&self.check_container, &command)
            .await
            .map(|_| ())
            .map_err(|e| OpsError::HealthCheck(format!("{} via {}: {}", url, self.check_container, e)))
    }
}

pub struct HealthMonitor {
    check: Arc<dyn HealthCheck>,
    attempts: u32,
    initial_backoff: Duration,
    max_backoff: Duration,
}

impl HealthMonitor {
    pub fn new(check: Arc<dyn HealthCheck>, attempts: u32, initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            check,
            attempts: attempts.max(1),
            initial_backoff,
            max_backoff,
        }
    }

    /// Monitor using the configured check: exec through the helper container
    /// when one is set, HTTP from the host otherwise.
    pub fn from_config(config: &Config, runtime: Arc<dyn ContainerRuntime>) -> Result<Self> {
        let check: Arc<dyn HealthCheck> = match &config.health.check_container {
            Some(helper) => Arc::new(ExecHealthCheck::new(config, runtime, helper.clone())),
            None => Arc::new(HttpHealthCheck::new(config, runtime)?),
        };
        Ok(Self::new(
            check,
            config.health.attempts,
            Duration::from_millis(config.health.initial_backoff_ms),
            Duration::from_millis(config.health.max_backoff_ms),
        ))
    }

    /// Delay after failed attempt `n` (0-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_backoff
            .checked_mul(factor)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }

    /// Poll until `container` is healthy or the attempt budget is spent.
    pub async fn wait_healthy(&self, container: &str) -> Result<()> {
        let mut last_error = String::new();
        for attempt in 0..self.attempts {
            match self.check.check(container).await {
                Ok(()) => {
                    info!(container, attempt = attempt + 1, "Health check passed");
                    return Ok(());
                }
                Err(e) => {
                    debug!(container, attempt = attempt + 1, error = %e, "Health check attempt failed");
                    last_error = e.to_string();
                }
            }
            if attempt + 1 < self.attempts {
                tokio::time::sleep(self.backoff(attempt)).await;
            }
        }

        warn!(container, attempts = self.attempts, error = %last_error, "Container never became healthy");
        Err(OpsError::HealthCheck(format!(
            "{} unhealthy after {} attempts: {}",
            container, self.attempts, last_error
        )))
    }
}
