//! Error types for cinder-core.

use std::time::Duration;
use thiserror::Error;

/// Result type alias for cinder-core operations.
pub type Result<T> = std::result::Result<T, CoreError>;

/// Errors that can occur while orchestrating VMs.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Error from cinder-vm (networking, socket, boot, start)
    #[error(transparent)]
    Vm(#[from] cinder_vm::VmError),

    /// Missing or invalid VM configuration
    #[error("configuration error: {0}")]
    Config(String),

    /// Every address in the guest pool is taken
    #[error("no free guest IPs left in {0}")]
    PoolExhausted(String),

    /// Guest never accepted SSH
    #[error("SSH to {host} failed after {attempts} attempts: {last_error}")]
    SshProbeFailed {
        /// Guest address
        host: String,
        /// Attempts made
        attempts: u32,
        /// Error from the final attempt
        last_error: String,
    },

    /// No ready SSH connection for this host
    #[error("not connected to SSH for host {0}")]
    NotConnected(String),

    /// Remote command exited non-zero
    #[error("command failed: {0}")]
    CommandFailed(String),

    /// SSH transport failure (dial, handshake, channel)
    #[error("SSH error: {0}")]
    Ssh(String),

    /// SSH handshake did not finish in time
    #[error("SSH handshake timed out after {0:?}")]
    SshTimeout(Duration),

    /// Shared state store failure
    #[error("store error: {0}")]
    Store(String),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<redis::RedisError> for CoreError {
    fn from(e: redis::RedisError) -> Self {
        CoreError::Store(e.to_string())
    }
}
