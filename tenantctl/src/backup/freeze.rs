//! Scoped container freeze.
//!
//! A [`FreezeGuard`] pauses a container on acquisition and must be handed
//! back through [`FreezeGuard::release`]. If a guard is dropped without being
//! released (a panic unwinding through the copy), the unpause is spawned
//! onto the current runtime so the container is never left frozen.

use crate::runtime::ContainerRuntime;
use crate::utils::errors::Result;
use std::sync::Arc;
use tracing::{error, info, warn};

pub struct FreezeGuard {
    runtime: Arc<dyn ContainerRuntime>,
    container: String,
    frozen: bool,
}

impl FreezeGuard {
    /// Pause `container`.
    ///
    /// A failed pause does not fail the acquisition: the guard is returned
    /// unfrozen and the caller copies from the live container.
    pub async fn acquire(runtime: Arc<dyn ContainerRuntime>, container: &str) -> Self {
        let frozen = match runtime.pause(container).await {
            Ok(()) => {
                info!(container, "Container paused");
                true
            }
            Err(e) => {
                warn!(container, error = %e, "Failed to pause container, copying live data");
                false
            }
        };

        Self {
            runtime,
            container: container.to_string(),
            frozen,
        }
    }

    /// Unpause the container if this guard paused it.
    pub async fn release(mut self) -> Result<()> {
        if !self.frozen {
            return Ok(());
        }
        self.frozen = false;

        match self.runtime.unpause(&self.container).await {
            Ok(()) => {
                info!(container = %self.container, "Container unpaused");
                Ok(())
            }
            Err(e) => {
                error!(container = %self.container, error = %e, alert = "container_left_paused", "Failed to unpause container");
                Err(e)
            }
        }
    }
}

impl Drop for FreezeGuard {
    fn drop(&mut self) {
        if !self.frozen {
            return;
        }

        let runtime = Arc::clone(&self.runtime);
        let container = self.container.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                warn!(container = %container, "Freeze guard dropped while paused, unpausing in background");
                handle.spawn(async move {
                    if let Err(e) = runtime.unpause(&container).await {
                        error!(container = %container, error = %e, alert = "container_left_paused", "Background unpause failed");
                    }
                });
            }
            Err(_) => {
                error!(container = %container, alert = "container_left_paused", "Freeze guard dropped outside a runtime, container stays paused");
            }
        }
    }
}
