//! Error types for cinder-vm.

use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for cinder-vm operations.
pub type Result<T> = std::result::Result<T, VmError>;

/// Errors that can occur while preparing or driving a microVM on the host.
#[derive(Debug, Error)]
pub enum VmError {
    /// Bridge, TAP or forwarding setup failed
    #[error("network provisioning failed: {0}")]
    NetworkProvision(String),

    /// Hypervisor process could not be launched
    #[error("failed to spawn hypervisor: {0}")]
    Spawn(String),

    /// The hypervisor never created its control socket
    #[error("control socket {path} did not appear within {timeout:?}")]
    SocketTimeout {
        /// Expected socket path
        path: PathBuf,
        /// How long we waited
        timeout: std::time::Duration,
    },

    /// A process-group id that must never be signalled (0, 1, or out of
    /// range), typically read from a damaged registry entry
    #[error("refusing to signal process group {0}")]
    InvalidProcessGroup(i64),

    /// One of the boot-source, drive or network-interface calls failed
    #[error("boot configuration failed: {0}")]
    BootConfig(String),

    /// InstanceStart was rejected
    #[error("failed to start VM: {0}")]
    Start(String),

    /// Non-2xx response from the hypervisor API
    #[error("{method} {path} failed with status {status}: {body}")]
    Api {
        /// HTTP method
        method: String,
        /// API path
        path: String,
        /// Response status code
        status: u16,
        /// Response body
        body: String,
    },

    /// Transport-level failure talking to the control socket
    #[error("control socket request failed: {0}")]
    Transport(String),

    /// A host command exited non-zero
    #[error("`{command}` exited with {code:?}: {stderr}")]
    Command {
        /// Command line that was run
        command: String,
        /// Exit code (None if killed by a signal)
        code: Option<i32>,
        /// Captured stderr
        stderr: String,
    },

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
