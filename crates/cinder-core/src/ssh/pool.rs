//! Per-host SSH connection pool and remote command execution.

use super::transport::{SshConnector, SshSession};
use crate::error::{CoreError, Result};
use base64::Engine;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;

/// Sourced before every remote command so node tooling installed through
/// nvm is on `PATH`.
const NVM_INIT: &str = r#"export NVM_DIR="/root/.nvm"; [ -s "$NVM_DIR/nvm.sh" ] && . "$NVM_DIR/nvm.sh""#;

/// Connection state of one host in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No entry; the next `connect` dials.
    Absent,
    /// A dial is in flight; concurrent `connect` calls wait for it.
    Connecting,
    /// Connected and reusable.
    Ready,
}

type Slot = Arc<OnceCell<Arc<dyn SshSession>>>;

/// One reusable SSH connection per guest.
///
/// A host's entry is created *before* the dial starts, so concurrent
/// `connect` calls for the same host share that one dial. Entries are
/// dropped when a dial fails or the connection is found dead.
pub struct SshPool {
    connector: Arc<dyn SshConnector>,
    slots: Mutex<HashMap<String, Slot>>,
}

impl SshPool {
    pub fn new(connector: Arc<dyn SshConnector>) -> Self {
        Self {
            connector,
            slots: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Slot>>> {
        self.slots
            .lock()
            .map_err(|_| CoreError::Ssh("connection pool lock poisoned".into()))
    }

    /// Current state of `host`.
    pub fn state(&self, host: &str) -> ConnectionState {
        match self.lock().ok().and_then(|slots| slots.get(host).cloned()) {
            None => ConnectionState::Absent,
            Some(slot) if slot.initialized() => ConnectionState::Ready,
            Some(_) => ConnectionState::Connecting,
        }
    }

    /// Hosts with an entry, in any state.
    pub fn hosts(&self) -> Vec<String> {
        self.lock()
            .map(|slots| slots.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Return the ready connection for `host`, dialing if there is none.
    pub async fn connect(&self, host: &str) -> Result<Arc<dyn SshSession>> {
        loop {
            let slot = {
                let mut slots = self.lock()?;
                slots
                    .entry(host.to_string())
                    .or_insert_with(|| Arc::new(OnceCell::new()))
                    .clone()
            };

            if let Some(session) = slot.get() {
                if session.is_alive().await {
                    tracing::debug!(host, "Reusing SSH connection");
                    return Ok(session.clone());
                }
                tracing::info!(host, "SSH connection closed, redialing");
                self.evict(host, &slot);
                discard(host, session.as_ref()).await;
                continue;
            }

            return match slot.get_or_try_init(|| self.dial(host)).await {
                Ok(session) if self.holds(host, &slot) => Ok(session.clone()),
                Ok(session) => {
                    tracing::info!(host, "Disconnected while connecting, dropping new connection");
                    discard(host, session.as_ref()).await;
                    Err(CoreError::NotConnected(host.to_string()))
                }
                Err(e) => {
                    self.evict(host, &slot);
                    Err(e)
                }
            };
        }
    }

    async fn dial(&self, host: &str) -> Result<Arc<dyn SshSession>> {
        tracing::info!(host, "Opening SSH connection");
        match self.connector.connect(host).await {
            Ok(session) => {
                tracing::info!(host, "SSH connection ready");
                Ok(session)
            }
            Err(e) => {
                tracing::debug!(host, error = %e, "SSH connect failed");
                Err(e)
            }
        }
    }

    /// Whether `host`'s entry is still `slot`.
    fn holds(&self, host: &str, slot: &Slot) -> bool {
        self.lock()
            .map(|slots| slots.get(host).is_some_and(|s| Arc::ptr_eq(s, slot)))
            .unwrap_or(false)
    }

    /// Remove `host`'s entry if it is still `slot`.
    fn evict(&self, host: &str, slot: &Slot) {
        if let Ok(mut slots) = self.lock() {
            if slots.get(host).is_some_and(|s| Arc::ptr_eq(s, slot)) {
                slots.remove(host);
            }
        }
    }

    fn ready(&self, host: &str) -> Result<(Slot, Arc<dyn SshSession>)> {
        let slot = self
            .lock()?
            .get(host)
            .cloned()
            .ok_or_else(|| CoreError::NotConnected(host.to_string()))?;
        let session = slot
            .get()
            .cloned()
            .ok_or_else(|| CoreError::NotConnected(host.to_string()))?;
        Ok((slot, session))
    }

    /// Run `command` on `host`, optionally inside `cwd` (created if missing).
    ///
    /// Requires a ready connection. Returns trimmed stdout on exit 0;
    /// otherwise [`CoreError::CommandFailed`] with stderr, or stdout when
    /// stderr is empty.
    pub async fn execute(&self, host: &str, command: &str, cwd: Option<&str>) -> Result<String> {
        let (slot, session) = self.ready(host)?;
        let wrapped = wrap_command(command, cwd);
        tracing::debug!(host, cwd = cwd.unwrap_or("~"), command, "Running remote command");

        let output = match session.exec(&wrapped).await {
            Ok(output) => output,
            Err(e) => {
                tracing::warn!(host, error = %e, "SSH connection failed, dropping it");
                self.evict(host, &slot);
                discard(host, session.as_ref()).await;
                return Err(e);
            }
        };

        if output.code == Some(0) {
            return Ok(output.stdout.trim().to_string());
        }
        let stderr = output.stderr.trim();
        let detail = if stderr.is_empty() {
            output.stdout.trim()
        } else {
            stderr
        };
        tracing::debug!(host, code = ?output.code, "Remote command failed");
        Err(CoreError::CommandFailed(detail.to_string()))
    }

    /// Write `content` to `path` on `host`, creating the parent directory.
    ///
    /// The body travels base64 encoded, so arbitrary bytes and quotes are
    /// safe. Returns a listing of the parent directory.
    pub async fn write_file(&self, host: &str, path: &str, content: &[u8]) -> Result<String> {
        let parent = parent_dir(path);
        self.execute(host, &format!("mkdir -p {}", quote(parent)), None)
            .await?;

        let encoded = base64::engine::general_purpose::STANDARD.encode(content);
        self.execute(
            host,
            &format!("echo '{encoded}' | base64 -d > {}", quote(path)),
            None,
        )
        .await?;
        tracing::debug!(host, path, bytes = content.len(), "Wrote remote file");

        self.execute(host, &format!("ls -la {}", quote(parent)), None)
            .await
    }

    /// `mkdir -p` on `host`.
    pub async fn create_dir(&self, host: &str, path: &str) -> Result<()> {
        self.execute(host, &format!("mkdir -p {}", quote(path)), None)
            .await
            .map(|_| ())
    }

    /// Close and forget `host`'s connection, or every connection when
    /// `host` is `None`.
    ///
    /// Entries are forgotten even when closing fails; the first close error
    /// is returned.
    pub async fn disconnect(&self, host: Option<&str>) -> Result<()> {
        let removed: Vec<(String, Slot)> = {
            let mut slots = self.lock()?;
            match host {
                Some(h) => slots.remove(h).map(|s| (h.to_string(), s)).into_iter().collect(),
                None => slots.drain().collect(),
            }
        };

        let mut first_error = None;
        for (host, slot) in removed {
            let Some(session) = slot.get() else { continue };
            match session.close().await {
                Ok(()) => tracing::info!(host = %host, "SSH disconnected"),
                Err(e) => {
                    tracing::warn!(host = %host, error = %e, "SSH disconnect failed");
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Close a connection that is being dropped anyway.
async fn discard(host: &str, session: &dyn SshSession) {
    if let Err(e) = session.close().await {
        tracing::debug!(host, error = %e, "Closing dropped SSH connection failed");
    }
}

/// Single-quote `s` for the remote shell.
fn quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

fn parent_dir(path: &str) -> &str {
    let trimmed = path.trim_end_matches('/');
    if trimmed.is_empty() && path.starts_with('/') {
        return "/";
    }
    match trimmed.rfind('/') {
        Some(0) => "/",
        Some(idx) => &trimmed[..idx],
        None => ".",
    }
}

/// Prefix `command` with the nvm init and the optional working directory.
fn wrap_command(command: &str, cwd: Option<&str>) -> String {
    match cwd {
        Some(dir) => {
            let dir = quote(dir);
            format!("{NVM_INIT}; mkdir -p {dir} && cd {dir} && {command}")
        }
        None => format!("{NVM_INIT}; {command}"),
    }
}
