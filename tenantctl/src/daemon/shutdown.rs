//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! A run already in progress (backup, drill) is allowed to finish; only new
//! runs are refused once the token is cancelled.

use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Shutdown coordinator
#[derive(Clone, Default)]
pub struct ShutdownCoordinator {
    token: CancellationToken,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token cancelled once shutdown begins
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Begin shutdown without waiting for a signal.
    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Wait for SIGINT or SIGTERM (or an earlier `trigger`), then cancel the token.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!(error = %e, "Failed to listen for Ctrl+C");
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    error!(error = %e, "Failed to install SIGTERM handler");
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => info!("Received SIGINT, shutting down"),
            _ = terminate => info!("Received SIGTERM, shutting down"),
            _ = self.token.cancelled() => info!("Shutdown requested"),
        }

        self.token.cancel();
    }
}
