//! SSH transport: one persistent connection per guest.
//!
//! [`OpenSshConnector`] drives the system `ssh` binary. The persistent
//! connection is an OpenSSH ControlMaster started in the background; every
//! command is then multiplexed over its control socket, so only the first
//! call pays for the handshake.

use crate::error::{CoreError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;

/// Guest SSH port.
pub const SSH_PORT: u16 = 22;

/// Handshake timeout for a new connection.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);

/// `ssh` exits with 255 when the failure is its own (connection, auth,
/// multiplexing) rather than the remote command's.
const SSH_TRANSPORT_FAILURE: i32 = 255;

/// Output of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

/// An established connection to one guest.
#[async_trait]
pub trait SshSession: Send + Sync {
    /// Run `command` through the remote shell.
    ///
    /// A non-zero exit is returned as output; `Err` means the connection
    /// itself failed.
    async fn exec(&self, command: &str) -> Result<ExecOutput>;

    /// Whether the connection is still usable.
    async fn is_alive(&self) -> bool;

    /// End the connection. A connection that is already gone counts as
    /// closed.
    async fn close(&self) -> Result<()>;
}

/// Opens [`SshSession`]s.
#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn connect(&self, host: &str) -> Result<Arc<dyn SshSession>>;
}

/// Connection settings for guest SSH.
#[derive(Debug, Clone)]
pub struct SshConfig {
    /// Remote user
    pub user: String,
    /// Remote port
    pub port: u16,
    /// Private key used for authentication
    pub private_key: PathBuf,
    /// Handshake timeout
    pub handshake_timeout: Duration,
    /// Where ControlMaster sockets are created
    pub control_dir: PathBuf,
}

impl Default for SshConfig {
    fn default() -> Self {
        let home = std::env::var("HOME").unwrap_or_else(|_| "/root".to_string());
        Self {
            user: "root".to_string(),
            port: SSH_PORT,
            private_key: PathBuf::from(home).join(".ssh/id_rsa"),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            control_dir: std::env::temp_dir(),
        }
    }
}

/// [`SshConnector`] backed by OpenSSH ControlMaster connections.
#[derive(Debug, Clone)]
pub struct OpenSshConnector {
    config: SshConfig,
}

impl OpenSshConnector {
    pub fn new(config: SshConfig) -> Self {
        Self { config }
    }

    fn control_path(&self, host: &str) -> PathBuf {
        self.config.control_dir.join(format!("cinder-ssh-{host}.ctl"))
    }

    /// Options shared by every invocation.
    ///
    /// Guests are ephemeral, so host keys are neither checked nor recorded.
    fn common_args(&self) -> Vec<String> {
        let mut args: Vec<String> = [
            "-o",
            "StrictHostKeyChecking=no",
            "-o",
            "UserKnownHostsFile=/dev/null",
            "-o",
            "LogLevel=ERROR",
            "-o",
            "BatchMode=yes",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();
        args.extend([
            "-o".to_string(),
            format!("ConnectTimeout={}", self.config.handshake_timeout.as_secs()),
            "-i".to_string(),
            self.config.private_key.to_string_lossy().into_owned(),
            "-p".to_string(),
            self.config.port.to_string(),
        ]);
        args
    }

    /// Arguments that start a background master for `host`.
    fn master_args(&self, host: &str, control: &std::path::Path) -> Vec<String> {
        let mut args = vec![
            "-M".to_string(),
            "-f".to_string(),
            "-N".to_string(),
            "-S".to_string(),
            control.to_string_lossy().into_owned(),
        ];
        args.extend(self.common_args());
        args.push(format!("{}@{host}", self.config.user));
        args
    }
}

#[async_trait]
impl SshConnector for OpenSshConnector {
    async fn connect(&self, host: &str) -> Result<Arc<dyn SshSession>> {
        let control = self.control_path(host);
        let session = OpenSshSession {
            host: host.to_string(),
            target: format!("{}@{host}", self.config.user),
            control: control.clone(),
            common: self.common_args(),
        };

        // A master left behind by an earlier process is reused as-is.
        if control.exists() {
            if session.is_alive().await {
                tracing::debug!(host, control = %control.display(), "Adopting existing SSH master");
                return Ok(Arc::new(session));
            }
            let _ = tokio::fs::remove_file(&control).await;
        }

        let mut cmd = Command::new("ssh");
        cmd.args(self.master_args(host, &control))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let output = tokio::time::timeout(self.config.handshake_timeout, cmd.output())
            .await
            .map_err(|_| CoreError::SshTimeout(self.config.handshake_timeout))?
            .map_err(|e| CoreError::Ssh(format!("failed to spawn ssh: {e}")))?;

        if !output.status.success() {
            return Err(CoreError::Ssh(format!(
                "connect to {host} failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        tracing::debug!(host, control = %control.display(), "SSH master started");
        Ok(Arc::new(session))
    }
}

/// A command channel multiplexed over a ControlMaster socket.
#[derive(Debug)]
struct OpenSshSession {
    host: String,
    target: String,
    control: PathBuf,
    common: Vec<String>,
}

impl OpenSshSession {
    fn control_command(&self, op: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-S")
            .arg(&self.control)
            .arg("-O")
            .arg(op)
            .args(&self.common)
            .arg(&self.target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        cmd
    }
}

#[async_trait]
impl SshSession for OpenSshSession {
    async fn exec(&self, command: &str) -> Result<ExecOutput> {
        let output = Command::new("ssh")
            .arg("-S")
            .arg(&self.control)
            .args(&self.common)
            .arg(&self.target)
            .arg("--")
            .arg(command)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| CoreError::Ssh(format!("failed to spawn ssh: {e}")))?;

        let result = ExecOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        if result.code == Some(SSH_TRANSPORT_FAILURE) {
            return Err(CoreError::Ssh(format!(
                "connection to {} lost: {}",
                self.host,
                result.stderr.trim()
            )));
        }
        Ok(result)
    }

    async fn is_alive(&self) -> bool {
        matches!(
            self.control_command("check").status().await,
            Ok(status) if status.success()
        )
    }

    async fn close(&self) -> Result<()> {
        let status = self
            .control_command("exit")
            .status()
            .await
            .map_err(|e| CoreError::Ssh(format!("failed to spawn ssh: {e}")))?;
        // `-O exit` also fails when the master is already gone.
        if !status.success() && self.is_alive().await {
            return Err(CoreError::Ssh(format!(
                "SSH master for {} did not exit",
                self.host
            )));
        }
        match tokio::fs::remove_file(&self.control).await {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
            _ => Ok(()),
        }
    }
}
