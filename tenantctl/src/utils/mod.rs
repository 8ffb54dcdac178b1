//! Utility modules for tenantctl.

pub mod errors;
pub mod logger;

pub use errors::{OpsError, Result};
