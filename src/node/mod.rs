//! Node Attachment Agent
//!
//! Per-node publish, unpublish and expand: iSCSI login, filesystem
//! preparation and mount, with the persisted connector state as the record
//! of what each attachment has to undo.

pub mod agent;
pub mod connector;
pub mod fs;
pub mod identity;
pub mod iscsi;

pub use agent::*;
pub use connector::*;
pub use fs::*;
pub use identity::*;
pub use iscsi::*;

use crate::error::{Error, Result};
use tokio::process::Command;
use tracing::trace;

/// Captured result of a host command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    /// Exit code, `None` if killed by a signal
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// stdout and stderr joined, for error messages
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr).trim().to_string()
    }
}

/// Run a host command and capture its output, whatever its exit code
pub async fn run(program: &str, args: &[&str]) -> Result<CommandOutput> {
    trace!(program = %program, ?args, "running command");
    let output = Command::new(program).args(args).output().await?;
    Ok(CommandOutput {
        status: output.status.code(),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
    })
}

/// Run a host command; a non-zero exit becomes [`Error::Command`]
pub async fn run_checked(program: &str, args: &[&str]) -> Result<String> {
    let output = run(program, args).await?;
    if output.success() {
        Ok(output.stdout)
    } else {
        Err(Error::Command {
            command: format!("{} {}", program, args.join(" ")),
            output: output.combined(),
        })
    }
}
