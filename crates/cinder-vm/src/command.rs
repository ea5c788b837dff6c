//! Host command execution.
//!
//! Network setup, socket permission fixes and cleanup all shell out to
//! standard tools (`ip`, `iptables`, `sysctl`, `chmod`, `rm`). They go through
//! [`CommandRunner`] so the callers can be exercised without root.

use crate::error::{Result, VmError};
use async_trait::async_trait;
use tokio::process::Command;

/// Captured result of a finished host command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when terminated by a signal.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

impl CommandOutput {
    /// Check if the command exited with status 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

/// Runs programs on the host.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program args...` to completion and capture its output.
    ///
    /// A non-zero exit is *not* an error at this level; only failing to
    /// spawn the process is.
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput>;

    /// Run a command and fail with [`VmError::Command`] on non-zero exit.
    async fn run_checked(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let output = self.run(program, args).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(VmError::Command {
                command: render(program, args),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

/// Build an owned argument vector from string slices.
pub fn args<const N: usize>(items: [&str; N]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

pub(crate) fn render(program: &str, args: &[String]) -> String {
    let mut line = program.to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}

/// [`CommandRunner`] backed by `tokio::process`, optionally through `sudo`.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    sudo: bool,
}

impl SystemRunner {
    /// Create a runner. With `sudo` set every program is run as
    /// `sudo -n <program> ...`.
    pub fn new(sudo: bool) -> Self {
        Self { sudo }
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<CommandOutput> {
        let mut cmd = if self.sudo {
            let mut c = Command::new("sudo");
            c.arg("-n").arg(program);
            c
        } else {
            Command::new(program)
        };
        cmd.args(args);

        tracing::trace!(command = %render(program, args), sudo = self.sudo, "Running host command");
        let output = cmd.output().await.map_err(|e| VmError::Command {
            command: render(program, args),
            code: None,
            stderr: format!("failed to spawn: {e}"),
        })?;

        let result = CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        tracing::trace!(
            command = %render(program, args),
            code = ?result.code,
            stderr = %result.stderr.trim(),
            "Host command finished"
        );
        Ok(result)
    }
}
