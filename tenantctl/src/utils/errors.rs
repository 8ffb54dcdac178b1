//! Custom error types for tenantctl.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OpsError {
    #[error("Configuration error: {0}")]
    Config(String),

    /// A required directory, tool or input is missing or malformed.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    /// A structured data file did not pass its consistency check.
    #[error("Integrity check failed for {path}: {detail}")]
    Integrity { path: PathBuf, detail: String },

    #[error("Copy of {path} failed: {source}")]
    Copy {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Remote sync error: {0}")]
    RemoteSync(String),

    #[error("Health check failed: {0}")]
    HealthCheck(String),

    #[error("Rollback failed: {0}")]
    Rollback(String),

    #[error("Container runtime error: {0}")]
    Runtime(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Task error: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl OpsError {
    pub fn copy(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        OpsError::Copy {
            path: path.into(),
            source,
        }
    }

    pub fn integrity(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        OpsError::Integrity {
            path: path.into(),
            detail: detail.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, OpsError>;
