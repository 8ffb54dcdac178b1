//! Tenant lifecycle operations for container-per-tenant hosts.
//!
//! Daily verified snapshots, canary-gated digest-pinned rollouts with
//! rollback, and restore drills that prove the snapshots are usable.

pub mod backup;
pub mod config;
pub mod daemon;
pub mod drill;
pub mod fs;
pub mod rollout;
pub mod runtime;
pub mod tenant;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use utils::errors::OpsError;
pub type Result<T> = std::result::Result<T, OpsError>;
