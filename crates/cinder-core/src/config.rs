//! VM and manager configuration.

use crate::error::CoreError;
use crate::ssh::{ProbeConfig, SshConfig, DEFAULT_BASE_DELAY, DEFAULT_MAX_RETRIES, HANDSHAKE_TIMEOUT, SSH_PORT};
use cinder_vm::boot::{DEFAULT_MEM_SIZE_MIB, DEFAULT_VCPU_COUNT};
use cinder_vm::NetworkConfig;
use std::path::PathBuf;
use std::time::Duration;

/// Per-VM settings supplied by the caller.
#[derive(Debug, Clone)]
pub struct VmConfig {
    /// Path to kernel image.
    pub kernel_path: PathBuf,
    /// Path to the base rootfs image. Each VM boots from its own copy.
    pub rootfs_path: PathBuf,
    /// vCPU count (default: 1).
    pub vcpu_count: u8,
    /// Memory in MiB (default: 512).
    pub mem_size_mib: u32,
    /// SSH readiness probe attempts (default: 10).
    pub ssh_max_retries: u32,
    /// SSH readiness probe base delay (default: 1s).
    pub ssh_base_delay: Duration,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            kernel_path: PathBuf::new(),
            rootfs_path: PathBuf::new(),
            vcpu_count: DEFAULT_VCPU_COUNT,
            mem_size_mib: DEFAULT_MEM_SIZE_MIB,
            ssh_max_retries: DEFAULT_MAX_RETRIES,
            ssh_base_delay: DEFAULT_BASE_DELAY,
        }
    }
}

impl VmConfig {
    /// Create a new config builder.
    pub fn builder() -> VmConfigBuilder {
        VmConfigBuilder::default()
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.kernel_path.as_os_str().is_empty() {
            return Err(CoreError::Config("kernel_path is required".into()));
        }
        if self.rootfs_path.as_os_str().is_empty() {
            return Err(CoreError::Config("rootfs_path is required".into()));
        }
        if self.vcpu_count == 0 {
            return Err(CoreError::Config("vcpu_count must be > 0".into()));
        }
        if self.mem_size_mib == 0 {
            return Err(CoreError::Config("mem_size_mib must be > 0".into()));
        }
        Ok(())
    }

    /// Readiness probe budget for this VM.
    pub fn probe(&self) -> ProbeConfig {
        ProbeConfig {
            max_retries: self.ssh_max_retries,
            base_delay: self.ssh_base_delay,
        }
    }
}

/// Builder for VmConfig.
#[derive(Debug, Default)]
pub struct VmConfigBuilder {
    config: VmConfig,
}

impl VmConfigBuilder {
    /// Set the kernel path.
    pub fn kernel(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.kernel_path = path.into();
        self
    }

    /// Set the base rootfs path.
    pub fn rootfs(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.rootfs_path = path.into();
        self
    }

    /// Set vCPU count.
    pub fn vcpu_count(mut self, count: u8) -> Self {
        self.config.vcpu_count = count;
        self
    }

    /// Set memory in MiB.
    pub fn mem_size_mib(mut self, mib: u32) -> Self {
        self.config.mem_size_mib = mib;
        self
    }

    /// Set SSH probe attempts.
    pub fn ssh_max_retries(mut self, retries: u32) -> Self {
        self.config.ssh_max_retries = retries;
        self
    }

    /// Set SSH probe base delay.
    pub fn ssh_base_delay(mut self, delay: Duration) -> Self {
        self.config.ssh_base_delay = delay;
        self
    }

    /// Build the configuration, validating all required fields.
    pub fn build(self) -> Result<VmConfig, CoreError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Host-wide settings for [`VmManager`](crate::VmManager).
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Hypervisor binary.
    pub hypervisor_bin: PathBuf,
    /// Hypervisor name, used in socket paths and the registry key.
    pub hypervisor_name: String,
    /// Directory for control sockets and rootfs copies.
    pub runtime_dir: PathBuf,
    /// Host bridge and uplink.
    pub network: NetworkConfig,
    /// Guest SSH settings.
    pub ssh: SshConfig,
    /// Run host commands and the hypervisor through `sudo -n`.
    pub sudo: bool,
    /// Redis server holding the IP pool and process registry.
    pub redis_url: Option<String>,
    /// Lock-guarded JSON file used for that state when `redis_url` is unset.
    pub state_file: PathBuf,
    /// Time the guest gets to act on Ctrl+Alt+Del before the hard kill.
    pub shutdown_grace: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            hypervisor_bin: PathBuf::from("/usr/local/bin/firecracker"),
            hypervisor_name: "firecracker".to_string(),
            runtime_dir: PathBuf::from("/tmp"),
            network: NetworkConfig::default(),
            ssh: SshConfig::default(),
            sudo: true,
            redis_url: None,
            state_file: PathBuf::from("/tmp/cinder-state.json"),
            shutdown_grace: Duration::from_millis(2000),
        }
    }
}

impl ManagerConfig {
    /// Load configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |----------|---------|
    /// | `CINDER_HYPERVISOR_BIN` | `/usr/local/bin/firecracker` |
    /// | `CINDER_HYPERVISOR_NAME` | `firecracker` |
    /// | `CINDER_RUNTIME_DIR` | `/tmp` |
    /// | `CINDER_BRIDGE` | `br0` |
    /// | `CINDER_UPLINK` | `eth0` |
    /// | `CINDER_SSH_USER` | `root` |
    /// | `CINDER_SSH_KEY` | `$HOME/.ssh/id_rsa` |
    /// | `CINDER_SUDO` | `true` |
    /// | `CINDER_REDIS_URL` | unset (use the state file) |
    /// | `CINDER_STATE_FILE` | `<runtime_dir>/cinder-state.json` |
    /// | `CINDER_SHUTDOWN_GRACE_MS` | `2000` |
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let default = Self::default();

        let runtime_dir = var("CINDER_RUNTIME_DIR")
            .map(PathBuf::from)
            .unwrap_or(default.runtime_dir);

        let network = NetworkConfig {
            bridge: var("CINDER_BRIDGE").unwrap_or(default.network.bridge),
            uplink: var("CINDER_UPLINK").unwrap_or(default.network.uplink),
            ..default.network
        };

        let ssh = SshConfig {
            user: var("CINDER_SSH_USER").unwrap_or(default.ssh.user),
            port: SSH_PORT,
            private_key: var("CINDER_SSH_KEY")
                .map(PathBuf::from)
                .unwrap_or(default.ssh.private_key),
            handshake_timeout: HANDSHAKE_TIMEOUT,
            control_dir: runtime_dir.clone(),
        };

        let state_file = var("CINDER_STATE_FILE")
            .map(PathBuf::from)
            .unwrap_or_else(|| runtime_dir.join("cinder-state.json"));

        Self {
            hypervisor_bin: var("CINDER_HYPERVISOR_BIN")
                .map(PathBuf::from)
                .unwrap_or(default.hypervisor_bin),
            hypervisor_name: var("CINDER_HYPERVISOR_NAME").unwrap_or(default.hypervisor_name),
            runtime_dir,
            network,
            ssh,
            sudo: var("CINDER_SUDO")
                .map(|v| v != "false" && v != "0")
                .unwrap_or(default.sudo),
            redis_url: var("CINDER_REDIS_URL").filter(|v| !v.is_empty()),
            state_file,
            shutdown_grace: var("CINDER_SHUTDOWN_GRACE_MS")
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(default.shutdown_grace),
        }
    }

    /// Control socket for VM `id`: `<runtime_dir>/<hypervisor>-<id>.socket`.
    pub fn socket_path(&self, id: &str) -> PathBuf {
        self.runtime_dir
            .join(format!("{}-{id}.socket", self.hypervisor_name))
    }

    /// Private rootfs copy for VM `id`: `<runtime_dir>/vm-<id>.ext4`.
    pub fn rootfs_copy_path(&self, id: &str) -> PathBuf {
        self.runtime_dir.join(format!("vm-{id}.ext4"))
    }
}
