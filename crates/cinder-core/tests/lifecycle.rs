//! End-to-end create/delete against fake host collaborators.
//!
//! The last test drives a real host and is ignored by default:
//! `cargo test -p cinder-core --test lifecycle -- --ignored`

use async_trait::async_trait;
use cinder_core::ssh::{ExecOutput, ProbeConfig, SshConnector, SshSession};
use cinder_core::{
    CoreError, IpAllocator, ManagerConfig, ManagerParts, MemoryStore, ProcessEntry, StateStore,
    TeardownStep, VmConfig, VmManager,
};
use cinder_vm::{
    CommandOutput, CommandRunner, HypervisorApi, NetworkProvisioner, ProcessLauncher,
    SignalOutcome, VmError,
};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Host {
    commands: Mutex<Vec<String>>,
    launched: Mutex<Vec<PathBuf>>,
    killed: Mutex<Vec<u32>>,
    taps_created: Mutex<Vec<String>>,
    taps_deleted: Mutex<Vec<String>>,
    api_calls: Mutex<Vec<(PathBuf, String, serde_json::Value)>>,
    network_down: AtomicBool,
    guest_gone: AtomicBool,
    ssh_down: AtomicBool,
    socket_never_appears: AtomicBool,
    kill_fails: AtomicBool,
    rm_fails: AtomicBool,
    tap_delete_fails: AtomicBool,
    failing_api_path: Mutex<Option<&'static str>>,
}

impl Host {
    fn api_paths(&self) -> Vec<String> {
        self.api_calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, path, _)| path.clone())
            .collect()
    }
}

struct Runner(Arc<Host>);

#[async_trait]
impl CommandRunner for Runner {
    async fn run(&self, program: &str, args: &[String]) -> cinder_vm::Result<CommandOutput> {
        self.0
            .commands
            .lock()
            .unwrap()
            .push(format!("{program} {}", args.join(" ")));
        if program == "rm" && self.0.rm_fails.load(Ordering::SeqCst) {
            return Ok(CommandOutput {
                code: Some(1),
                stderr: "rm: cannot remove: Read-only file system".into(),
                ..Default::default()
            });
        }
        Ok(CommandOutput {
            code: Some(0),
            ..Default::default()
        })
    }
}

struct Launcher(Arc<Host>);

#[async_trait]
impl ProcessLauncher for Launcher {
    fn launch(&self, _binary: &Path, socket: &Path) -> cinder_vm::Result<u32> {
        if !self.0.socket_never_appears.load(Ordering::SeqCst) {
            std::fs::write(socket, b"")?;
        }
        let mut launched = self.0.launched.lock().unwrap();
        launched.push(socket.to_path_buf());
        Ok(1000 + launched.len() as u32)
    }

    async fn kill_group(&self, pgid: u32) -> cinder_vm::Result<SignalOutcome> {
        self.0.killed.lock().unwrap().push(pgid);
        if self.0.kill_fails.load(Ordering::SeqCst) {
            return Err(VmError::Io(std::io::Error::from_raw_os_error(1)));
        }
        Ok(if self.0.guest_gone.load(Ordering::SeqCst) {
            SignalOutcome::AlreadyGone
        } else {
            SignalOutcome::Delivered
        })
    }
}

struct Network(Arc<Host>);

#[async_trait]
impl NetworkProvisioner for Network {
    async fn ensure_bridge(&self) -> cinder_vm::Result<()> {
        if self.0.network_down.load(Ordering::SeqCst) {
            return Err(VmError::NetworkProvision("ip link add br0 failed".into()));
        }
        Ok(())
    }

    async fn create_tap(&self, tap: &str) -> cinder_vm::Result<()> {
        self.0.taps_created.lock().unwrap().push(tap.to_string());
        Ok(())
    }

    async fn enable_forwarding(&self) -> cinder_vm::Result<()> {
        Ok(())
    }

    async fn delete_tap(&self, tap: &str) -> cinder_vm::Result<()> {
        self.0.taps_deleted.lock().unwrap().push(tap.to_string());
        if self.0.tap_delete_fails.load(Ordering::SeqCst) {
            return Err(VmError::NetworkProvision(format!(
                "`ip link del {tap}` failed: Device or resource busy"
            )));
        }
        Ok(())
    }
}

struct Api {
    socket: PathBuf,
    host: Arc<Host>,
}

#[async_trait]
impl HypervisorApi for Api {
    async fn get(&self, _path: &str) -> cinder_vm::Result<String> {
        Ok("{}".into())
    }

    async fn put(&self, path: &str, body: serde_json::Value) -> cinder_vm::Result<String> {
        if self.host.guest_gone.load(Ordering::SeqCst) {
            return Err(VmError::Transport("connection refused".into()));
        }
        if *self.host.failing_api_path.lock().unwrap() == Some(path) {
            return Err(VmError::Api {
                method: "PUT".into(),
                path: path.to_string(),
                status: 400,
                body: r#"{"fault_message":"rejected"}"#.into(),
            });
        }
        self.host
            .api_calls
            .lock()
            .unwrap()
            .push((self.socket.clone(), path.to_string(), body));
        Ok(String::new())
    }
}

struct Guest;

#[async_trait]
impl SshSession for Guest {
    async fn exec(&self, command: &str) -> cinder_core::Result<ExecOutput> {
        Ok(ExecOutput {
            code: Some(0),
            stdout: format!("ran: {}\n", command.rsplit("; ").next().unwrap_or_default()),
            stderr: String::new(),
        })
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn close(&self) -> cinder_core::Result<()> {
        Ok(())
    }
}

struct Ssh(Arc<Host>);

#[async_trait]
impl SshConnector for Ssh {
    async fn connect(&self, _host: &str) -> cinder_core::Result<Arc<dyn SshSession>> {
        if self.0.ssh_down.load(Ordering::SeqCst) {
            return Err(CoreError::Ssh("Connection refused".into()));
        }
        Ok(Arc::new(Guest))
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    base_rootfs: PathBuf,
    host: Arc<Host>,
    store: Arc<MemoryStore>,
    manager: VmManager,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let base_rootfs = dir.path().join("base.ext4");
    std::fs::write(&base_rootfs, b"rootfs image").unwrap();

    let config = ManagerConfig {
        runtime_dir: dir.path().join("run"),
        shutdown_grace: Duration::from_millis(10),
        ..ManagerConfig::default()
    };

    let host = Arc::new(Host::default());
    let store = Arc::new(MemoryStore::new());
    let api_host = host.clone();
    let parts = ManagerParts {
        store: store.clone(),
        runner: Arc::new(Runner(host.clone())),
        launcher: Arc::new(Launcher(host.clone())),
        network: Arc::new(Network(host.clone())),
        ssh: Arc::new(Ssh(host.clone())),
        api: Arc::new(move |socket: &Path| -> Arc<dyn HypervisorApi> {
            Arc::new(Api {
                socket: socket.to_path_buf(),
                host: api_host.clone(),
            })
        }),
    };

    Fixture {
        manager: VmManager::new(config, parts),
        base_rootfs,
        host,
        store,
        _dir: dir,
    }
}

/// Nothing the failed create touched is left behind.
async fn assert_rolled_back(f: &Fixture) {
    assert!(f.manager.ips().allocated().await.unwrap().is_empty());
    assert!(f.manager.registry().entries().await.unwrap().is_empty());
    assert_eq!(
        *f.host.taps_deleted.lock().unwrap(),
        *f.host.taps_created.lock().unwrap()
    );
    let leftover: Vec<_> = std::fs::read_dir(&f.manager.config().runtime_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == "ext4"))
        .collect();
    assert!(leftover.is_empty(), "{leftover:?}");
}

fn vm_config(f: &Fixture) -> VmConfig {
    VmConfig::builder()
        .kernel("/images/vmlinux")
        .rootfs(&f.base_rootfs)
        .ssh_max_retries(2)
        .ssh_base_delay(Duration::from_millis(1))
        .build()
        .unwrap()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_create_then_delete() {
    let f = fixture();
    let vm = f.manager.create(vm_config(&f)).await.unwrap();

    assert_eq!(vm.id.as_str().len(), 32);
    assert!(IpAllocator::in_pool(vm.vm_ip));
    let mac = vm.mac.to_string();
    assert_eq!(mac.len(), 17);
    assert_eq!(mac.split(':').count(), 6);
    assert_eq!(vm.mac.octets()[0] & 0x03, 0x02);
    assert_eq!(vm.vcpu_count, 1);
    assert_eq!(vm.mem_size_mib, 512);

    let run = f.manager.config().runtime_dir.clone();
    assert_eq!(
        vm.socket_path,
        run.join(format!("firecracker-{}.socket", vm.id))
    );
    assert_eq!(vm.rootfs_path, run.join(format!("vm-{}.ext4", vm.id)));
    assert_eq!(std::fs::read(&vm.rootfs_path).unwrap(), b"rootfs image");

    let tap = vm.id.tap_name();
    assert_eq!(*f.host.taps_created.lock().unwrap(), vec![tap.clone()]);

    // Boot calls are concurrent, so only the set is fixed; the rest is ordered.
    let paths = f.host.api_paths();
    assert_eq!(paths.len(), 5);
    let mut boot: Vec<_> = paths[..3].to_vec();
    boot.sort();
    assert_eq!(
        boot,
        ["/boot-source", "/drives/rootfs", "/network-interfaces/eth0"]
    );
    assert_eq!(&paths[3..], ["/machine-config", "/actions"]);

    {
        let calls = f.host.api_calls.lock().unwrap();
        let boot_source = calls
            .iter()
            .find(|(_, p, _)| p == "/boot-source")
            .map(|(_, _, b)| b.clone())
            .unwrap();
        let args = boot_source["boot_args"].as_str().unwrap();
        assert!(args.contains(&format!(
            "ip={}::172.16.0.1:255.255.255.0::eth0:off",
            vm.vm_ip
        )));
        let nic = calls
            .iter()
            .find(|(_, p, _)| p == "/network-interfaces/eth0")
            .map(|(_, _, b)| b.clone())
            .unwrap();
        assert_eq!(nic["guest_mac"], mac);
        assert_eq!(nic["host_dev_name"], tap);
    }

    let entry = f
        .manager
        .registry()
        .find(&vm.socket_path)
        .await
        .unwrap()
        .unwrap();
    assert!(entry.pid < 0);
    assert!(f
        .store
        .set_contains("allocated_ips", &vm.vm_ip.to_string())
        .await
        .unwrap());

    let report = f.manager.delete(&vm.id, vm.vm_ip).await;
    assert!(report.is_clean(), "{report:?}");

    assert!(!f.manager.ips().is_allocated(vm.vm_ip).await.unwrap());
    assert!(f.manager.registry().entries().await.unwrap().is_empty());
    assert!(!vm.rootfs_path.exists());
    assert_eq!(*f.host.killed.lock().unwrap(), vec![entry.pgid().unwrap()]);
    assert_eq!(*f.host.taps_deleted.lock().unwrap(), vec![tap]);
    assert!(f
        .host
        .commands
        .lock()
        .unwrap()
        .contains(&format!("rm -f {}", vm.socket_path.display())));
    assert_eq!(f.host.api_paths().last().map(String::as_str), Some("/actions"));
}

#[tokio::test]
async fn test_delete_after_guest_already_exited() {
    let f = fixture();
    let vm = f.manager.create(vm_config(&f)).await.unwrap();

    f.host.guest_gone.store(true, Ordering::SeqCst);
    let report = f.manager.delete(&vm.id, vm.vm_ip).await;

    // Only the Ctrl+Alt+Del fails; everything else still happens.
    let failed: Vec<_> = report.failures().map(|s| s.step).collect();
    assert_eq!(failed, vec![TeardownStep::Shutdown]);
    assert!(report.attempted(TeardownStep::ReleaseIp));
    assert!(!f.manager.ips().is_allocated(vm.vm_ip).await.unwrap());
    assert!(f.manager.registry().entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_delete_unknown_vm_still_completes() {
    let f = fixture();
    let report = f
        .manager
        .delete(&"0123456789abcdef".into(), Ipv4Addr::new(172, 16, 0, 77))
        .await;
    assert!(report.attempted(TeardownStep::DeleteTap));
    assert!(report.attempted(TeardownStep::ReleaseIp));
    assert!(f.host.killed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_ssh_probe_failure_rolls_back() {
    let f = fixture();
    f.host.ssh_down.store(true, Ordering::SeqCst);

    let err = f.manager.create(vm_config(&f)).await.unwrap_err();
    assert!(matches!(err, CoreError::SshProbeFailed { attempts: 2, .. }));

    assert!(f.manager.ips().allocated().await.unwrap().is_empty());
    assert!(f.manager.registry().entries().await.unwrap().is_empty());
    assert_eq!(f.host.killed.lock().unwrap().len(), 1);
    assert_eq!(f.host.taps_deleted.lock().unwrap().len(), 1);

    let leftover: Vec<_> = std::fs::read_dir(&f.manager.config().runtime_dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().extension().is_some_and(|x| x == "ext4"))
        .collect();
    assert!(leftover.is_empty());
}

#[tokio::test]
async fn test_network_failure_rolls_back_before_spawn() {
    let f = fixture();
    f.host.network_down.store(true, Ordering::SeqCst);

    let err = f.manager.create(vm_config(&f)).await.unwrap_err();
    assert!(matches!(err, CoreError::Vm(VmError::NetworkProvision(_))));
    assert!(f.host.launched.lock().unwrap().is_empty());
    assert!(f.manager.ips().allocated().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_invalid_config_has_no_side_effects() {
    let f = fixture();
    let config = VmConfig {
        kernel_path: PathBuf::new(),
        ..vm_config(&f)
    };
    let err = f.manager.create(config).await.unwrap_err();
    assert!(matches!(err, CoreError::Config(_)));
    assert!(f.host.commands.lock().unwrap().is_empty());
    assert!(f.manager.ips().allocated().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_missing_rootfs_is_reported() {
    let f = fixture();
    let config = VmConfig {
        rootfs_path: PathBuf::from("/nonexistent/rootfs.ext4"),
        ..vm_config(&f)
    };
    let err = f.manager.create(config).await.unwrap_err();
    assert!(err.to_string().contains("/nonexistent/rootfs.ext4"));
    assert!(f.manager.ips().allocated().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_concurrent_creates_get_distinct_resources() {
    let f = fixture();
    let config = vm_config(&f);
    let (a, b, c) = tokio::join!(
        f.manager.create(config.clone()),
        f.manager.create(config.clone()),
        f.manager.create(config),
    );
    let vms = [a.unwrap(), b.unwrap(), c.unwrap()];

    let mut ips: Vec<_> = vms.iter().map(|v| v.vm_ip).collect();
    ips.sort();
    ips.dedup();
    assert_eq!(ips.len(), 3);
    assert_eq!(f.manager.registry().entries().await.unwrap().len(), 3);
}

#[tokio::test]
async fn test_commands_after_create() {
    let f = fixture();
    let vm = f.manager.create(vm_config(&f)).await.unwrap();

    let out = f
        .manager
        .execute(vm.vm_ip, "node -v", Some("/app"))
        .await
        .unwrap();
    assert_eq!(out, "ran: mkdir -p '/app' && cd '/app' && node -v");

    f.manager.create_dir(vm.vm_ip, "/app/src").await.unwrap();
    f.manager
        .write_file(vm.vm_ip, "/app/src/index.js", b"console.log(1)")
        .await
        .unwrap();

    f.manager.disconnect(Some(vm.vm_ip)).await.unwrap();
    let err = f.manager.execute(vm.vm_ip, "ls", None).await.unwrap_err();
    assert!(matches!(err, CoreError::NotConnected(_)));

    f.manager.connect(vm.vm_ip).await.unwrap();
    f.manager
        .probe(vm.vm_ip, ProbeConfig::default())
        .await
        .unwrap();
    assert!(f.manager.execute(vm.vm_ip, "ls", None).await.is_ok());
}

#[tokio::test]
async fn test_delete_continues_past_kill_and_socket_failures() {
    let f = fixture();
    let vm = f.manager.create(vm_config(&f)).await.unwrap();

    f.host.kill_fails.store(true, Ordering::SeqCst);
    f.host.rm_fails.store(true, Ordering::SeqCst);
    let report = f.manager.delete(&vm.id, vm.vm_ip).await;

    let failed: Vec<_> = report.failures().map(|s| s.step).collect();
    assert_eq!(
        failed,
        vec![TeardownStep::KillProcess, TeardownStep::RemoveSocket]
    );
    for step in [
        TeardownStep::RemoveRootfs,
        TeardownStep::DeleteTap,
        TeardownStep::ReleaseIp,
    ] {
        assert!(report.attempted(step), "{step} skipped");
    }
    assert!(!vm.rootfs_path.exists());
    assert_eq!(*f.host.taps_deleted.lock().unwrap(), vec![vm.id.tap_name()]);
    assert!(!f.manager.ips().is_allocated(vm.vm_ip).await.unwrap());
    assert!(f.manager.registry().entries().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_tap_delete_failure_is_reported() {
    let f = fixture();
    let vm = f.manager.create(vm_config(&f)).await.unwrap();

    f.host.tap_delete_fails.store(true, Ordering::SeqCst);
    let report = f.manager.delete(&vm.id, vm.vm_ip).await;

    assert!(!report.is_clean());
    let failed: Vec<_> = report.failures().collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].step, TeardownStep::DeleteTap);
    assert!(failed[0]
        .error
        .as_deref()
        .is_some_and(|e| e.contains("Device or resource busy")));
    assert!(!f.manager.ips().is_allocated(vm.vm_ip).await.unwrap());
}

#[tokio::test]
async fn test_boot_config_failure_rolls_back() {
    let f = fixture();
    *f.host.failing_api_path.lock().unwrap() = Some("/drives/rootfs");

    let err = f.manager.create(vm_config(&f)).await.unwrap_err();
    assert!(matches!(err, CoreError::Vm(VmError::BootConfig(_))));
    assert_eq!(f.host.killed.lock().unwrap().len(), 1);
    assert!(!f.host.api_paths().iter().any(|p| p == "/actions"));
    assert_rolled_back(&f).await;
}

#[tokio::test]
async fn test_start_failure_rolls_back() {
    let f = fixture();
    *f.host.failing_api_path.lock().unwrap() = Some("/actions");

    let err = f.manager.create(vm_config(&f)).await.unwrap_err();
    assert!(matches!(err, CoreError::Vm(VmError::Start(_))));
    assert!(f.host.api_paths().iter().any(|p| p == "/machine-config"));
    assert_eq!(f.host.killed.lock().unwrap().len(), 1);
    assert_rolled_back(&f).await;
}

#[tokio::test(start_paused = true)]
async fn test_socket_timeout_rolls_back() {
    let f = fixture();
    f.host.socket_never_appears.store(true, Ordering::SeqCst);

    let err = f.manager.create(vm_config(&f)).await.unwrap_err();
    assert!(matches!(err, CoreError::Vm(VmError::SocketTimeout { .. })));
    // Killed once by the supervisor; nothing was registered for teardown.
    assert_eq!(f.host.killed.lock().unwrap().len(), 1);
    assert!(f.host.api_paths().is_empty());
    assert_rolled_back(&f).await;
}

#[tokio::test]
async fn test_default_managers_share_state_across_instances() {
    let dir = tempfile::tempdir().unwrap();
    let config = ManagerConfig {
        runtime_dir: dir.path().join("run"),
        state_file: dir.path().join("state/cinder-state.json"),
        sudo: false,
        redis_url: None,
        ..ManagerConfig::default()
    };

    // Two managers stand in for two `cinder` invocations.
    let first = VmManager::from_config(config.clone()).await.unwrap();
    let second = VmManager::from_config(config).await.unwrap();

    let a = first.ips().allocate().await.unwrap();
    let b = second.ips().allocate().await.unwrap();
    assert_ne!(a, b);
    assert!(second.ips().is_allocated(a).await.unwrap());

    let socket = dir.path().join("run/firecracker-abc.socket");
    first
        .registry()
        .append(ProcessEntry::new(&socket, 4242))
        .await
        .unwrap();
    let seen = second.registry().find(&socket).await.unwrap().unwrap();
    assert_eq!(seen.pgid(), Some(4242));

    second.ips().release(a).await.unwrap();
    assert!(!first.ips().is_allocated(a).await.unwrap());
}

/// Full lifecycle on a real host.
///
/// Needs root (or passwordless sudo), /dev/kvm, Firecracker, and a guest
/// image with sshd and the host's key installed.
#[tokio::test]
#[ignore = "requires Linux + KVM + Firecracker + bridge networking"]
async fn test_real_host_lifecycle() {
    let kernel = std::env::var("CINDER_KERNEL_PATH")
        .unwrap_or_else(|_| "/var/lib/cinder/vmlinux".to_string());
    let rootfs = std::env::var("CINDER_ROOTFS_PATH")
        .unwrap_or_else(|_| "/var/lib/cinder/rootfs.ext4".to_string());
    if !Path::new(&kernel).exists() || !Path::new(&rootfs).exists() {
        eprintln!("Skipping test: kernel or rootfs not found");
        eprintln!("Set CINDER_KERNEL_PATH and CINDER_ROOTFS_PATH environment variables");
        return;
    }

    let manager = VmManager::from_config(ManagerConfig::from_env())
        .await
        .expect("manager");
    let vm = manager
        .create(
            VmConfig::builder()
                .kernel(&kernel)
                .rootfs(&rootfs)
                .build()
                .unwrap(),
        )
        .await
        .expect("create");

    let out = manager.execute(vm.vm_ip, "echo hello", None).await.unwrap();
    assert_eq!(out, "hello");

    let report = manager.delete(&vm.id, vm.vm_ip).await;
    assert!(report.is_clean(), "{report:?}");
}
