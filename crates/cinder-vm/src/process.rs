//! Launching and signalling hypervisor processes.
//!
//! Each hypervisor runs in its own process group so that it outlives the
//! orchestrator and so that a later kill of the group takes down anything
//! it forked (including a `sudo` wrapper).

use crate::command::{args, CommandRunner};
use crate::error::{Result, VmError};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use tokio::process::Command;

/// Outcome of signalling a process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// The signal was delivered.
    Delivered,
    /// No such process group; it already exited.
    AlreadyGone,
}

/// Check that `pgid` names a process group other than our own (0) or
/// init's (1), and that it fits in `pid_t`.
pub fn group_target(pgid: u32) -> Result<Pid> {
    match i32::try_from(pgid) {
        Ok(raw) if raw > 1 => Ok(Pid::from_raw(-raw)),
        _ => Err(VmError::InvalidProcessGroup(i64::from(pgid))),
    }
}

/// Starts hypervisor processes and signals them later.
#[async_trait]
pub trait ProcessLauncher: Send + Sync {
    /// Start `binary --api-sock <socket>` detached in a new process group and
    /// return its pid (which is also the process group id).
    fn launch(&self, binary: &Path, socket: &Path) -> Result<u32>;

    /// Send `SIGKILL` to process group `pgid`.
    async fn kill_group(&self, pgid: u32) -> Result<SignalOutcome>;
}

/// [`ProcessLauncher`] for the local host.
///
/// With `sudo` the group leader is the `sudo` process and the hypervisor
/// runs as root, out of reach of an unprivileged `kill(2)`. The kill then
/// goes through `runner` as `kill -KILL -- -<pgid>`, which the runner
/// elevates the same way it elevates every other host command.
#[derive(Clone)]
pub struct SystemLauncher {
    runner: Arc<dyn CommandRunner>,
    sudo: bool,
}

impl SystemLauncher {
    /// Create a launcher; with `sudo` the hypervisor runs as
    /// `sudo -n <binary> ...`.
    pub fn new(runner: Arc<dyn CommandRunner>, sudo: bool) -> Self {
        Self { runner, sudo }
    }

    async fn kill_elevated(&self, pgid: u32) -> Result<SignalOutcome> {
        let target = format!("-{pgid}");
        let output = self
            .runner
            .run("kill", &args(["-KILL", "--", &target]))
            .await?;
        if output.success() {
            Ok(SignalOutcome::Delivered)
        } else if output.stderr.contains("No such process") {
            Ok(SignalOutcome::AlreadyGone)
        } else {
            Err(VmError::Command {
                command: format!("kill -KILL -- {target}"),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }
}

#[async_trait]
impl ProcessLauncher for SystemLauncher {
    fn launch(&self, binary: &Path, socket: &Path) -> Result<u32> {
        let mut cmd = if self.sudo {
            let mut c = Command::new("sudo");
            c.arg("-n").arg(binary);
            c
        } else {
            Command::new(binary)
        };
        cmd.arg("--api-sock")
            .arg(socket)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .kill_on_drop(false);

        let child = cmd
            .spawn()
            .map_err(|e| VmError::Spawn(format!("{}: {e}", binary.display())))?;
        let pid = child
            .id()
            .ok_or_else(|| VmError::Spawn("process exited before its pid was read".into()))?;

        // Dropping the handle leaves the process running; tokio reaps it
        // if it exits while we are still alive.
        drop(child);

        tracing::info!(pid, binary = %binary.display(), socket = %socket.display(), "Hypervisor launched");
        Ok(pid)
    }

    async fn kill_group(&self, pgid: u32) -> Result<SignalOutcome> {
        let target = group_target(pgid)?;
        if self.sudo {
            return self.kill_elevated(pgid).await;
        }
        match signal::kill(target, Signal::SIGKILL) {
            Ok(()) => Ok(SignalOutcome::Delivered),
            Err(Errno::ESRCH) => Ok(SignalOutcome::AlreadyGone),
            Err(e) => Err(VmError::Io(e.into())),
        }
    }
}
