//! Boot sequencing against a freshly spawned hypervisor.
//!
//! Order on the wire:
//! 1. boot-source, root drive and network interface, issued concurrently
//! 2. machine-config
//! 3. InstanceStart
//!
//! `InstanceStart` succeeding only means the vCPUs are running; guest
//! readiness is established later over SSH.

use crate::api::{ActionType, BootSource, Drive, InstanceAction, MachineConfiguration, NetworkInterface};
use crate::client::HypervisorApi;
use crate::error::{Result, VmError};
use crate::identity::MacAddr;
use crate::network::{GATEWAY_IP, NETMASK};
use serde::Serialize;
use std::net::Ipv4Addr;
use std::path::Path;

/// Default vCPU count when the caller does not choose one.
pub const DEFAULT_VCPU_COUNT: u8 = 1;

/// Default guest memory in MiB.
pub const DEFAULT_MEM_SIZE_MIB: u32 = 512;

/// Guest-side interface name.
pub const GUEST_IFACE: &str = "eth0";

/// Addressing handed to the guest kernel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IpConfig {
    /// Guest address
    pub vm_ip: Ipv4Addr,
    /// Host (bridge) address
    pub host_ip: Ipv4Addr,
    /// Default gateway
    pub gateway: Ipv4Addr,
    /// Subnet mask
    pub netmask: Ipv4Addr,
    /// DNS servers
    pub nameservers: Vec<Ipv4Addr>,
}

impl IpConfig {
    /// Standard configuration for a guest on the cinder bridge.
    pub fn for_guest(vm_ip: Ipv4Addr) -> Self {
        Self {
            vm_ip,
            host_ip: GATEWAY_IP,
            gateway: GATEWAY_IP,
            netmask: NETMASK,
            nameservers: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(8, 8, 4, 4)],
        }
    }

    /// Kernel `ip=` parameter value: `<vm>::<gw>:<mask>::eth0:off`.
    pub fn kernel_ip_param(&self) -> String {
        format!(
            "{}::{}:{}::{GUEST_IFACE}:off",
            self.vm_ip, self.gateway, self.netmask
        )
    }
}

/// Full kernel command line for a guest.
pub fn boot_args(ip: &IpConfig) -> String {
    format!(
        "console=ttyS0 reboot=k panic=1 pci=off ip={} root=/dev/vda rw",
        ip.kernel_ip_param()
    )
}

/// Everything `configure_boot` needs to describe one guest.
#[derive(Debug, Clone)]
pub struct BootParams<'a> {
    pub ip: &'a IpConfig,
    pub kernel_image: &'a Path,
    pub rootfs: &'a Path,
    pub mac: MacAddr,
    pub tap: &'a str,
}

async fn put_json<T: Serialize>(api: &dyn HypervisorApi, path: &str, body: &T) -> Result<String> {
    api.put(path, serde_json::to_value(body)?).await
}

/// Issue boot-source, root drive and network-interface concurrently.
///
/// All three must succeed; the first failure is returned as
/// [`VmError::BootConfig`].
pub async fn configure_boot(api: &dyn HypervisorApi, params: &BootParams<'_>) -> Result<()> {
    let args = boot_args(params.ip);
    tracing::debug!(boot_args = %args, tap = params.tap, mac = %params.mac, "Configuring boot");

    let boot_source = BootSource {
        kernel_image_path: params.kernel_image.to_string_lossy().into_owned(),
        boot_args: args,
    };
    let drive = Drive::rootfs(params.rootfs.to_string_lossy());
    let iface = NetworkInterface {
        iface_id: GUEST_IFACE.into(),
        guest_mac: params.mac.to_string(),
        host_dev_name: params.tap.to_string(),
    };
    let iface_path = format!("/network-interfaces/{GUEST_IFACE}");
    let drive_path = format!("/drives/{}", drive.drive_id);

    tokio::try_join!(
        put_json(api, "/boot-source", &boot_source),
        put_json(api, &drive_path, &drive),
        put_json(api, &iface_path, &iface),
    )
    .map_err(|e| VmError::BootConfig(e.to_string()))?;

    tracing::info!(tap = params.tap, "Boot source, rootfs and network configured");
    Ok(())
}

/// Set vCPU count and memory. `None` falls back to 1 vCPU / 512 MiB.
pub async fn configure_machine(
    api: &dyn HypervisorApi,
    vcpu_count: Option<u8>,
    mem_size_mib: Option<u32>,
) -> Result<MachineConfiguration> {
    let config = MachineConfiguration {
        vcpu_count: vcpu_count.unwrap_or(DEFAULT_VCPU_COUNT),
        mem_size_mib: mem_size_mib.unwrap_or(DEFAULT_MEM_SIZE_MIB),
    };
    put_json(api, "/machine-config", &config)
        .await
        .map_err(|e| VmError::BootConfig(e.to_string()))?;
    tracing::info!(
        vcpu_count = config.vcpu_count,
        mem_size_mib = config.mem_size_mib,
        "Machine resources configured"
    );
    Ok(config)
}

/// Issue `InstanceStart`.
pub async fn start_instance(api: &dyn HypervisorApi) -> Result<()> {
    let action = InstanceAction {
        action_type: ActionType::InstanceStart,
    };
    put_json(api, "/actions", &action)
        .await
        .map_err(|e| VmError::Start(e.to_string()))?;
    tracing::info!("InstanceStart accepted");
    Ok(())
}

/// Ask the guest to shut down (`SendCtrlAltDel`).
pub async fn send_ctrl_alt_del(api: &dyn HypervisorApi) -> Result<()> {
    let action = InstanceAction {
        action_type: ActionType::SendCtrlAltDel,
    };
    put_json(api, "/actions", &action).await?;
    Ok(())
}
