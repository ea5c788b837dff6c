//! Guest SSH: transport, connection pool, and readiness probe.

mod pool;
mod probe;
mod transport;

pub use pool::{ConnectionState, SshPool};
pub use probe::{backoff_delay, probe, ProbeConfig, DEFAULT_BASE_DELAY, DEFAULT_MAX_RETRIES};
pub use transport::{
    ExecOutput, OpenSshConnector, SshConfig, SshConnector, SshSession, HANDSHAKE_TIMEOUT,
    SSH_PORT,
};
