//! VM lifecycle: create and delete pipelines.

use crate::config::{ManagerConfig, VmConfig};
use crate::error::{CoreError, Result};
use crate::ip::IpAllocator;
use crate::registry::ProcessRegistry;
use crate::ssh::{self, OpenSshConnector, ProbeConfig, SshConnector, SshPool};
use crate::store::{FileStore, RedisStore, StateStore};
use crate::supervisor::HypervisorSupervisor;
use crate::teardown::{TeardownReport, TeardownStep};
use chrono::{DateTime, Utc};
use cinder_vm::boot::{self, BootParams};
use cinder_vm::{
    ApiClient, CommandRunner, HostNetwork, HypervisorApi, IpConfig, MacAddr, NetworkProvisioner,
    ProcessLauncher, SystemLauncher, SystemRunner, VmId, VmIdentity,
};
use serde::Serialize;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

/// Opens a hypervisor API client for a control socket.
pub type ApiFactory = Arc<dyn Fn(&Path) -> Arc<dyn HypervisorApi> + Send + Sync>;

/// Host-facing collaborators of [`VmManager`].
pub struct ManagerParts {
    pub store: Arc<dyn StateStore>,
    pub runner: Arc<dyn CommandRunner>,
    pub launcher: Arc<dyn ProcessLauncher>,
    pub network: Arc<dyn NetworkProvisioner>,
    pub ssh: Arc<dyn SshConnector>,
    pub api: ApiFactory,
}

/// What `create` hands back. The caller owns persisting it.
#[derive(Debug, Clone, Serialize)]
pub struct VmCreated {
    pub id: VmId,
    pub vm_ip: Ipv4Addr,
    pub mac: MacAddr,
    pub socket_path: PathBuf,
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    pub rootfs_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

/// Host resources a VM holds. Creation fills it in as it goes so a failure
/// can undo exactly what was done.
#[derive(Debug)]
struct Footprint {
    id: VmId,
    rootfs: Option<PathBuf>,
    ip: Option<Ipv4Addr>,
    tap: Option<String>,
    socket: Option<PathBuf>,
}

impl Footprint {
    fn empty(id: VmId) -> Self {
        Self {
            id,
            rootfs: None,
            ip: None,
            tap: None,
            socket: None,
        }
    }
}

/// Creates and deletes VMs and runs commands in them.
///
/// All shared state (IP pool, process registry) lives in the injected
/// [`StateStore`], so several managers, in one process or many, can work
/// against the same host.
pub struct VmManager {
    config: ManagerConfig,
    ips: IpAllocator,
    network: Arc<dyn NetworkProvisioner>,
    supervisor: HypervisorSupervisor,
    ssh: SshPool,
    api: ApiFactory,
}

impl VmManager {
    /// Assemble a manager from explicit collaborators.
    pub fn new(config: ManagerConfig, parts: ManagerParts) -> Self {
        let registry = ProcessRegistry::new(parts.store.clone(), &config.hypervisor_name);
        let supervisor = HypervisorSupervisor::new(
            parts.launcher,
            parts.runner,
            registry,
            config.hypervisor_bin.clone(),
        );
        Self {
            ips: IpAllocator::new(parts.store),
            network: parts.network,
            supervisor,
            ssh: SshPool::new(parts.ssh),
            api: parts.api,
            config,
        }
    }

    /// Manager on the real host: system commands and `ssh`. Shared state
    /// goes to Redis when `redis_url` is set, otherwise to `state_file`, so
    /// separate processes always see the same IP pool and registry.
    pub async fn from_config(config: ManagerConfig) -> Result<Self> {
        let store: Arc<dyn StateStore> = match &config.redis_url {
            Some(url) => Arc::new(RedisStore::connect(url).await?),
            None => Arc::new(FileStore::open(&config.state_file)?),
        };
        let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new(config.sudo));
        let network = Arc::new(HostNetwork::new(runner.clone(), config.network.clone()));
        let parts = ManagerParts {
            store,
            launcher: Arc::new(SystemLauncher::new(runner.clone(), config.sudo)),
            network,
            runner,
            ssh: Arc::new(OpenSshConnector::new(config.ssh.clone())),
            api: Arc::new(|socket: &Path| -> Arc<dyn HypervisorApi> { Arc::new(ApiClient::new(socket)) }),
        };
        Ok(Self::new(config, parts))
    }

    /// Manager configuration.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Guest IP pool.
    pub fn ips(&self) -> &IpAllocator {
        &self.ips
    }

    /// Durable record of running hypervisors.
    pub fn registry(&self) -> &ProcessRegistry {
        self.supervisor.registry()
    }

    /// SSH connections held by this manager.
    pub fn ssh(&self) -> &SshPool {
        &self.ssh
    }

    /// Create, boot and wait for a VM.
    ///
    /// 1. copy the rootfs to `<runtime_dir>/vm-<id>.ext4`
    /// 2. allocate a guest IP
    /// 3. bridge, TAP and forwarding
    /// 4. spawn the hypervisor and wait for its socket
    /// 5. boot source, drive and NIC (concurrently), then machine config
    /// 6. start, then wait for SSH
    ///
    /// If any step fails, everything done so far is torn down before the
    /// error is returned.
    pub async fn create(&self, config: VmConfig) -> Result<VmCreated> {
        config.validate()?;
        let identity = VmIdentity::generate();
        let start = Instant::now();
        tracing::info!(
            vm_id = %identity.id,
            vcpus = config.vcpu_count,
            mem_mib = config.mem_size_mib,
            "Creating VM"
        );

        let mut footprint = Footprint::empty(identity.id.clone());
        match self.build(&config, &identity, &mut footprint).await {
            Ok(created) => {
                tracing::info!(
                    vm_id = %created.id,
                    vm_ip = %created.vm_ip,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "VM ready"
                );
                Ok(created)
            }
            Err(e) => {
                tracing::error!(vm_id = %identity.id, error = %e, "VM creation failed, rolling back");
                let report = self.teardown(&footprint, false).await;
                if !report.is_clean() {
                    tracing::warn!(
                        vm_id = %identity.id,
                        failed_steps = report.failures().count(),
                        "Rollback left resources behind"
                    );
                }
                Err(e)
            }
        }
    }

    async fn build(
        &self,
        config: &VmConfig,
        identity: &VmIdentity,
        footprint: &mut Footprint,
    ) -> Result<VmCreated> {
        let id = identity.id.as_str();

        tokio::fs::create_dir_all(&self.config.runtime_dir).await?;
        let rootfs = self.config.rootfs_copy_path(id);
        footprint.rootfs = Some(rootfs.clone());
        tokio::fs::copy(&config.rootfs_path, &rootfs)
            .await
            .map_err(|e| {
                CoreError::Config(format!(
                    "cannot copy rootfs {}: {e}",
                    config.rootfs_path.display()
                ))
            })?;
        tracing::debug!(vm_id = id, rootfs = %rootfs.display(), "Rootfs copied");

        let vm_ip = self.ips.allocate().await?;
        footprint.ip = Some(vm_ip);
        let ip_config = IpConfig::for_guest(vm_ip);

        let tap = identity.id.tap_name();
        footprint.tap = Some(tap.clone());
        self.network.provision(&tap).await?;
        tracing::debug!(vm_id = id, tap = %tap, vm_ip = %vm_ip, "Network ready");

        let socket = self.config.socket_path(id);
        footprint.socket = Some(socket.clone());
        self.supervisor.spawn(&socket).await?;

        let api = (self.api)(&socket);
        boot::configure_boot(
            api.as_ref(),
            &BootParams {
                ip: &ip_config,
                kernel_image: &config.kernel_path,
                rootfs: &rootfs,
                mac: identity.mac,
                tap: &tap,
            },
        )
        .await?;
        let machine = boot::configure_machine(
            api.as_ref(),
            Some(config.vcpu_count),
            Some(config.mem_size_mib),
        )
        .await?;
        boot::start_instance(api.as_ref()).await?;
        tracing::info!(vm_id = id, vm_ip = %vm_ip, "VM started, waiting for SSH");

        ssh::probe(&self.ssh, &vm_ip.to_string(), config.probe()).await?;

        Ok(VmCreated {
            id: identity.id.clone(),
            vm_ip,
            mac: identity.mac,
            socket_path: socket,
            vcpu_count: machine.vcpu_count,
            mem_size_mib: machine.mem_size_mib,
            rootfs_path: rootfs,
            created_at: Utc::now(),
        })
    }

    /// Tear down VM `id` that was given `vm_ip`.
    ///
    /// Every step is attempted whatever happened to the previous ones, and
    /// whether or not the guest is still running. Failures are collected in
    /// the returned report rather than returned as an error.
    pub async fn delete(&self, id: &VmId, vm_ip: Ipv4Addr) -> TeardownReport {
        tracing::info!(vm_id = %id, vm_ip = %vm_ip, "Deleting VM");
        let footprint = Footprint {
            id: id.clone(),
            rootfs: Some(self.config.rootfs_copy_path(id.as_str())),
            ip: Some(vm_ip),
            tap: Some(id.tap_name()),
            socket: Some(self.config.socket_path(id.as_str())),
        };
        let report = self.teardown(&footprint, true).await;
        tracing::info!(vm_id = %id, clean = report.is_clean(), "VM deleted");
        report
    }

    /// Undo whatever `footprint` records. `graceful` asks the guest to shut
    /// down before the hard kill.
    async fn teardown(&self, footprint: &Footprint, graceful: bool) -> TeardownReport {
        let mut report = TeardownReport::new(footprint.id.as_str());

        if let Some(ip) = footprint.ip {
            let result = self.ssh.disconnect(Some(&ip.to_string())).await;
            report.record(TeardownStep::DisconnectSsh, result);
        }

        if let Some(socket) = &footprint.socket {
            if graceful {
                let result = self.shutdown(socket).await;
                report.record(TeardownStep::Shutdown, result);
            }
            let result = self.supervisor.stop(socket).await.map(|_| ());
            report.record(TeardownStep::KillProcess, result);
            let result = self.supervisor.remove_socket(socket).await;
            report.record(TeardownStep::RemoveSocket, result);
        }

        if let Some(rootfs) = &footprint.rootfs {
            let result = match tokio::fs::remove_file(rootfs).await {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
                _ => Ok(()),
            };
            report.record(TeardownStep::RemoveRootfs, result);
        }

        if let Some(tap) = &footprint.tap {
            let result = self.network.delete_tap(tap).await;
            report.record(TeardownStep::DeleteTap, result);
        }

        // Last, so the address is not handed out while the old guest may
        // still be using it.
        if let Some(ip) = footprint.ip {
            let result = self.ips.release(ip).await;
            report.record(TeardownStep::ReleaseIp, result);
        }

        report
    }

    /// Ctrl+Alt+Del, then give the guest the configured grace period.
    async fn shutdown(&self, socket: &Path) -> Result<()> {
        let api = (self.api)(socket);
        boot::send_ctrl_alt_del(api.as_ref()).await?;
        tokio::time::sleep(self.config.shutdown_grace).await;
        Ok(())
    }

    /// Connect to the guest at `vm_ip`, reusing an existing connection.
    pub async fn connect(&self, vm_ip: Ipv4Addr) -> Result<()> {
        self.ssh.connect(&vm_ip.to_string()).await.map(|_| ())
    }

    /// Wait for the guest at `vm_ip` to accept SSH.
    pub async fn probe(&self, vm_ip: Ipv4Addr, config: ProbeConfig) -> Result<()> {
        ssh::probe(&self.ssh, &vm_ip.to_string(), config).await
    }

    /// Run `command` in the guest, optionally inside `cwd`.
    pub async fn execute(&self, vm_ip: Ipv4Addr, command: &str, cwd: Option<&str>) -> Result<String> {
        self.ssh.execute(&vm_ip.to_string(), command, cwd).await
    }

    /// Write `content` to `path` in the guest. Returns a listing of the
    /// parent directory.
    pub async fn write_file(&self, vm_ip: Ipv4Addr, path: &str, content: &[u8]) -> Result<String> {
        self.ssh.write_file(&vm_ip.to_string(), path, content).await
    }

    /// `mkdir -p` in the guest.
    pub async fn create_dir(&self, vm_ip: Ipv4Addr, path: &str) -> Result<()> {
        self.ssh.create_dir(&vm_ip.to_string(), path).await
    }

    /// Drop SSH connections: one guest, or all of them.
    pub async fn disconnect(&self, vm_ip: Option<Ipv4Addr>) -> Result<()> {
        let host = vm_ip.map(|ip| ip.to_string());
        self.ssh.disconnect(host.as_deref()).await
    }
}
