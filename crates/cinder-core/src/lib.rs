//! # cinder-core
//!
//! Lifecycle orchestration for Firecracker microVMs on a single host.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                        VmManager                         │
//! │   create() ─ delete() ─ execute() ─ write_file()         │
//! ├──────────────────────────────────────────────────────────┤
//! │                                                          │
//! │  ┌──────────────┐   ┌──────────────────┐  ┌───────────┐  │
//! │  │ IpAllocator  │   │ HypervisorSuper- │  │  SshPool  │  │
//! │  │ allocated_ips│   │ visor + Process- │  │  + probe  │  │
//! │  └──────┬───────┘   │ Registry         │  └─────┬─────┘  │
//! │         │           └───────┬──────────┘        │        │
//! │         ▼                   ▼                   ▼        │
//! │  ┌──────────────────────────────────┐   ┌─────────────┐  │
//! │  │ StateStore (Redis or state file) │   │ ssh master  │  │
//! │  └──────────────────────────────────┘   └─────────────┘  │
//! │                                                          │
//! └──────────────────────────────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌──────────────────────────────────────────────────────────┐
//! │  cinder-vm: TAP/bridge/NAT, process launch, REST client  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use cinder_core::{ManagerConfig, VmConfig, VmManager};
//!
//! # async fn example() -> cinder_core::Result<()> {
//! let manager = VmManager::from_config(ManagerConfig::from_env()).await?;
//!
//! let vm = manager
//!     .create(
//!         VmConfig::builder()
//!             .kernel("/var/lib/cinder/vmlinux")
//!             .rootfs("/var/lib/cinder/rootfs.ext4")
//!             .mem_size_mib(1024)
//!             .build()?,
//!     )
//!     .await?;
//!
//! let out = manager.execute(vm.vm_ip, "node -v", Some("/app")).await?;
//! println!("{out}");
//!
//! let report = manager.delete(&vm.id, vm.vm_ip).await;
//! assert!(report.is_clean());
//! # Ok(())
//! # }
//! ```

mod config;
mod error;
mod ip;
mod manager;
mod registry;
pub mod ssh;
mod store;
mod supervisor;
mod teardown;

pub use config::{ManagerConfig, VmConfig, VmConfigBuilder};
pub use error::{CoreError, Result};
pub use ip::{IpAllocator, ALLOCATED_IPS_KEY};
pub use manager::{ApiFactory, ManagerParts, VmCreated, VmManager};
pub use registry::{ProcessEntry, ProcessRegistry};
pub use store::{FileStore, MemoryStore, RedisStore, StateStore};
pub use supervisor::{HypervisorSupervisor, SOCKET_POLL_INTERVAL, SOCKET_TIMEOUT};
pub use teardown::{StepOutcome, TeardownReport, TeardownStep};
