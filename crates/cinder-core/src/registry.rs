//! Durable record of running hypervisor processes.
//!
//! Stored as a JSON array `[{"api_socket": ..., "pid": ...}]` under
//! `<hypervisor>:list`. `pid` holds the *negated* process id, i.e. the
//! target for a process-group kill, so any orchestrator instance (including
//! one started after a crash) can find and stop a hypervisor by socket path.

use crate::error::{CoreError, Result};
use crate::store::StateStore;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// How many times a contended update is retried before giving up.
const MAX_CAS_ATTEMPTS: usize = 32;

/// One hypervisor process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessEntry {
    /// Control socket the hypervisor was started with
    pub api_socket: PathBuf,
    /// Negated pid (process-group id to signal)
    pub pid: i64,
}

impl ProcessEntry {
    /// Entry for a process group led by `pid`.
    pub fn new(api_socket: impl Into<PathBuf>, pid: u32) -> Self {
        Self {
            api_socket: api_socket.into(),
            pid: -i64::from(pid),
        }
    }

    /// Positive process-group id to signal.
    ///
    /// `None` when the stored value cannot name a hypervisor group: not
    /// negative, the negation of 0 or 1, or outside `pid_t`. Entries come
    /// from a store other processes write to, so this is checked on read.
    pub fn pgid(&self) -> Option<u32> {
        let pgid = self.pid.checked_neg()?;
        if (2..=i64::from(i32::MAX)).contains(&pgid) {
            u32::try_from(pgid).ok()
        } else {
            None
        }
    }
}

/// Registry of hypervisor processes keyed by control socket.
#[derive(Clone)]
pub struct ProcessRegistry {
    store: Arc<dyn StateStore>,
    key: String,
}

impl ProcessRegistry {
    /// Registry for hypervisor `name`, stored at `<name>:list`.
    pub fn new(store: Arc<dyn StateStore>, name: &str) -> Self {
        Self {
            store,
            key: format!("{name}:list"),
        }
    }

    /// Store key in use.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// All entries.
    pub async fn entries(&self) -> Result<Vec<ProcessEntry>> {
        Ok(self.load().await?.1)
    }

    /// Entry for `socket`, if any.
    pub async fn find(&self, socket: &Path) -> Result<Option<ProcessEntry>> {
        Ok(self
            .entries()
            .await?
            .into_iter()
            .find(|e| e.api_socket == socket))
    }

    /// Record `entry`, replacing any previous entry for the same socket.
    pub async fn append(&self, entry: ProcessEntry) -> Result<()> {
        tracing::debug!(socket = %entry.api_socket.display(), pid = entry.pid, "Registering hypervisor");
        self.update(|list| {
            list.retain(|e| e.api_socket != entry.api_socket);
            list.push(entry.clone());
        })
        .await
        .map(|_| ())
    }

    /// Remove and return the entry for `socket`.
    pub async fn remove(&self, socket: &Path) -> Result<Option<ProcessEntry>> {
        let mut removed = None;
        self.update(|list| {
            removed = list
                .iter()
                .position(|e| e.api_socket == socket)
                .map(|idx| list.remove(idx));
        })
        .await?;
        if let Some(entry) = &removed {
            tracing::debug!(socket = %socket.display(), pid = entry.pid, "Deregistered hypervisor");
        }
        Ok(removed)
    }

    async fn load(&self) -> Result<(Option<String>, Vec<ProcessEntry>)> {
        let raw = self.store.get(&self.key).await?;
        let list = match raw.as_deref() {
            None | Some("") => Vec::new(),
            Some(s) => serde_json::from_str(s)?,
        };
        Ok((raw, list))
    }

    /// Optimistic read-modify-write.
    async fn update<F>(&self, mut mutate: F) -> Result<Vec<ProcessEntry>>
    where
        F: FnMut(&mut Vec<ProcessEntry>) + Send,
    {
        for attempt in 1..=MAX_CAS_ATTEMPTS {
            let (raw, mut list) = self.load().await?;
            mutate(&mut list);
            let new = serde_json::to_string(&list)?;
            if self
                .store
                .compare_and_set(&self.key, raw.as_deref(), &new)
                .await?
            {
                return Ok(list);
            }
            tracing::trace!(attempt, key = %self.key, "Registry update raced, retrying");
            tokio::task::yield_now().await;
        }
        Err(CoreError::Store(format!(
            "registry {} still contended after {MAX_CAS_ATTEMPTS} attempts",
            self.key
        )))
    }
}
