//! # cinder-vm
//!
//! Host-side mechanics for Firecracker microVMs. Nothing in this crate keeps
//! state between calls; shared, durable bookkeeping lives in `cinder-core`.
//!
//! ## Pieces
//!
//! - **Identity**: `VmId` generation and the SHA-1 derived `MacAddr`
//! - **Networking**: bridge, per-VM TAP device and NAT via `NetworkProvisioner`
//! - **Processes**: detached hypervisor launch and process-group kill
//! - **API client**: REST over the hypervisor's unix control socket
//! - **Boot**: boot-source / drive / NIC, machine-config, InstanceStart
//!
//! ## Quick Start
//!
//! ```no_run
//! use cinder_vm::{boot, ApiClient, IpConfig, VmIdentity};
//! use std::net::Ipv4Addr;
//! use std::path::Path;
//!
//! # async fn example() -> cinder_vm::Result<()> {
//! let identity = VmIdentity::generate();
//! let ip = IpConfig::for_guest(Ipv4Addr::new(172, 16, 0, 2));
//! let api = ApiClient::new("/tmp/firecracker-example.socket");
//! let tap = identity.id.tap_name();
//!
//! boot::configure_boot(
//!     &api,
//!     &boot::BootParams {
//!         ip: &ip,
//!         kernel_image: Path::new("/var/lib/cinder/vmlinux"),
//!         rootfs: Path::new("/tmp/vm-example.ext4"),
//!         mac: identity.mac,
//!         tap: &tap,
//!     },
//! )
//! .await?;
//! boot::configure_machine(&api, Some(1), Some(512)).await?;
//! boot::start_instance(&api).await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod boot;
mod client;
mod command;
mod error;
mod identity;
mod network;
mod process;

pub use boot::{boot_args, IpConfig};
pub use client::{ApiClient, HypervisorApi};
pub use command::{args, CommandOutput, CommandRunner, SystemRunner};
pub use error::{Result, VmError};
pub use identity::{MacAddr, VmId, VmIdentity};
pub use network::{
    HostNetwork, NetworkConfig, NetworkProvisioner, DEFAULT_BRIDGE, DEFAULT_UPLINK, GATEWAY_IP,
    NETMASK,
};
pub use process::{group_target, ProcessLauncher, SignalOutcome, SystemLauncher};
