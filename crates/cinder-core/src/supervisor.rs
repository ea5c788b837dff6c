//! Hypervisor process supervision.

use crate::error::Result;
use crate::registry::{ProcessEntry, ProcessRegistry};
use cinder_vm::{args, CommandRunner, ProcessLauncher, SignalOutcome, VmError};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Interval between control-socket existence checks.
pub const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long a fresh hypervisor gets to create its control socket.
pub const SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

/// Starts hypervisors, waits for their control sockets, and records them in
/// the [`ProcessRegistry`] so they can be stopped from any process later.
#[derive(Clone)]
pub struct HypervisorSupervisor {
    launcher: Arc<dyn ProcessLauncher>,
    runner: Arc<dyn CommandRunner>,
    registry: ProcessRegistry,
    binary: PathBuf,
    socket_timeout: Duration,
}

impl HypervisorSupervisor {
    pub fn new(
        launcher: Arc<dyn ProcessLauncher>,
        runner: Arc<dyn CommandRunner>,
        registry: ProcessRegistry,
        binary: impl Into<PathBuf>,
    ) -> Self {
        Self {
            launcher,
            runner,
            registry,
            binary: binary.into(),
            socket_timeout: SOCKET_TIMEOUT,
        }
    }

    pub fn registry(&self) -> &ProcessRegistry {
        &self.registry
    }

    /// Launch the hypervisor on `socket` and register it.
    ///
    /// Either the process ends up running with a usable socket and a
    /// registry entry, or it is killed again and an error is returned:
    ///
    /// 1. launch detached in a new process group
    /// 2. poll for the socket every 100 ms, giving up after 5 s
    /// 3. `chmod 666` the socket
    /// 4. append `{api_socket, -pid}` to the registry
    pub async fn spawn(&self, socket: &Path) -> Result<ProcessEntry> {
        let pid = self.launcher.launch(&self.binary, socket)?;
        let entry = ProcessEntry::new(socket, pid);

        if let Err(e) = self.prepare(socket, &entry).await {
            tracing::warn!(pid, socket = %socket.display(), error = %e, "Hypervisor setup failed, killing it");
            let _ = self.kill(&entry).await;
            return Err(e);
        }

        tracing::info!(pid, socket = %socket.display(), "Hypervisor ready");
        Ok(entry)
    }

    async fn prepare(&self, socket: &Path, entry: &ProcessEntry) -> Result<()> {
        self.wait_for_socket(socket).await?;

        let path = socket.to_string_lossy();
        self.runner
            .run_checked("chmod", &args(["666", path.as_ref()]))
            .await?;

        self.registry.append(entry.clone()).await
    }

    async fn wait_for_socket(&self, socket: &Path) -> Result<()> {
        let start = Instant::now();
        let deadline = start + self.socket_timeout;
        loop {
            if socket.exists() {
                tracing::debug!(
                    socket = %socket.display(),
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Control socket appeared"
                );
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(VmError::SocketTimeout {
                    path: socket.to_path_buf(),
                    timeout: self.socket_timeout,
                }
                .into());
            }
            tokio::time::sleep(SOCKET_POLL_INTERVAL).await;
        }
    }

    /// Kill the process group recorded in `entry`.
    ///
    /// A group that no longer exists counts as success. An entry whose pid
    /// cannot name a hypervisor group is refused without signalling.
    pub async fn kill(&self, entry: &ProcessEntry) -> Result<SignalOutcome> {
        let result = match entry.pgid() {
            Some(pgid) => self.launcher.kill_group(pgid).await,
            None => Err(VmError::InvalidProcessGroup(entry.pid.saturating_neg())),
        };
        match result {
            Ok(outcome) => {
                tracing::debug!(pid = entry.pid, ?outcome, "Signalled hypervisor group");
                Ok(outcome)
            }
            Err(e) => {
                tracing::warn!(pid = entry.pid, error = %e, "Failed to kill hypervisor group");
                Err(e.into())
            }
        }
    }

    /// Kill whatever the registry holds for `socket` and drop its entry.
    ///
    /// The entry is removed even when the kill fails. Returns `None` when
    /// nothing was registered for the socket.
    pub async fn stop(&self, socket: &Path) -> Result<Option<SignalOutcome>> {
        let Some(entry) = self.registry.remove(socket).await? else {
            tracing::debug!(socket = %socket.display(), "No registered hypervisor for socket");
            return Ok(None);
        };
        self.kill(&entry).await.map(Some)
    }

    /// `rm -f` the control socket.
    pub async fn remove_socket(&self, socket: &Path) -> Result<()> {
        let path = socket.to_string_lossy();
        self.runner
            .run_checked("rm", &args(["-f", path.as_ref()]))
            .await?;
        Ok(())
    }
}
