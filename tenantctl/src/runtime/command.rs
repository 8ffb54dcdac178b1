//! External command execution.
//!
//! Every external tool (container runtime CLI, rclone, aws) is invoked
//! through [`CommandRunner`] so that adapters can be exercised against
//! scripted output.

use crate::utils::errors::{OpsError, Result};
use async_trait::async_trait;
use tracing::debug;

/// Captured result of one command invocation
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    /// Exit code (None when killed by a signal)
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` with `args` to completion and capture its output.
    ///
    /// A non-zero exit is not an error here; failing to spawn the program is.
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;
}

/// Runs commands as child processes of this one
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        debug!(program, args = ?args, "Running command");
        let output = tokio::process::Command::new(program)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| OpsError::Precondition(format!("failed to execute {}: {}", program, e)))?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Build an owned argument vector from string slices.
pub fn args<I, S>(items: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    items.into_iter().map(Into::into).collect()
}
