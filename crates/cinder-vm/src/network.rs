//! Host networking for guests: a shared bridge, one TAP per VM, and NAT.
//!
//! ```text
//!   guest eth0 ── tap_xxxxxxxx ──┐
//!   guest eth0 ── tap_yyyyyyyy ──┼── br0 (172.16.0.1/24) ── NAT ── uplink
//!   guest eth0 ── tap_zzzzzzzz ──┘
//! ```
//!
//! Setup is a sequence of idempotent host commands; any failure aborts VM
//! creation. TAP removal is best-effort.

use crate::command::{args, CommandRunner};
use crate::error::{Result, VmError};
use async_trait::async_trait;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Default bridge name.
pub const DEFAULT_BRIDGE: &str = "br0";

/// Default host uplink used for masquerading.
pub const DEFAULT_UPLINK: &str = "eth0";

/// Bridge / gateway address seen by guests.
pub const GATEWAY_IP: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 1);

/// Guest subnet mask.
pub const NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Host network settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// Bridge device name
    pub bridge: String,
    /// Address assigned to the bridge (the guests' gateway)
    pub gateway: Ipv4Addr,
    /// Prefix length of the guest subnet
    pub prefix_len: u8,
    /// Uplink interface NAT traffic leaves through
    pub uplink: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bridge: DEFAULT_BRIDGE.into(),
            gateway: GATEWAY_IP,
            prefix_len: 24,
            uplink: DEFAULT_UPLINK.into(),
        }
    }
}

/// Prepares and tears down host networking for guests.
#[async_trait]
pub trait NetworkProvisioner: Send + Sync {
    /// Create the bridge if missing, assign the gateway address, bring it up.
    async fn ensure_bridge(&self) -> Result<()>;

    /// Replace any stale `tap` device with a fresh one attached to the bridge.
    async fn create_tap(&self, tap: &str) -> Result<()>;

    /// Enable IPv4 forwarding and install NAT / forward-accept rules.
    async fn enable_forwarding(&self) -> Result<()>;

    /// Remove a TAP device. A device that is already gone counts as
    /// removed; any other failure is logged and returned.
    async fn delete_tap(&self, tap: &str) -> Result<()>;

    /// Full per-VM setup in the required order.
    async fn provision(&self, tap: &str) -> Result<()> {
        self.ensure_bridge().await?;
        self.create_tap(tap).await?;
        self.enable_forwarding().await
    }
}

/// [`NetworkProvisioner`] that drives `ip`, `sysctl` and `iptables`.
pub struct HostNetwork {
    runner: Arc<dyn CommandRunner>,
    config: NetworkConfig,
    owner_uid: u32,
}

impl HostNetwork {
    /// Create a provisioner. TAP devices are owned by the current user.
    pub fn new(runner: Arc<dyn CommandRunner>, config: NetworkConfig) -> Self {
        let owner_uid = nix::unistd::getuid().as_raw();
        Self {
            runner,
            config,
            owner_uid,
        }
    }

    /// Override the TAP owner.
    pub fn with_owner_uid(mut self, uid: u32) -> Self {
        self.owner_uid = uid;
        self
    }

    /// Get the network configuration.
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    async fn step(&self, program: &str, argv: Vec<String>) -> Result<()> {
        self.runner
            .run_checked(program, &argv)
            .await
            .map(|_| ())
            .map_err(|e| VmError::NetworkProvision(e.to_string()))
    }

    /// Run a command, treating "already exists" style failures as success.
    async fn step_tolerant(&self, program: &str, argv: Vec<String>) -> Result<()> {
        let out = self
            .runner
            .run(program, &argv)
            .await
            .map_err(|e| VmError::NetworkProvision(e.to_string()))?;
        if out.success() || already_exists(&out.stderr) {
            return Ok(());
        }
        Err(VmError::NetworkProvision(format!(
            "`{program} {}` failed: {}",
            argv.join(" "),
            out.stderr.trim()
        )))
    }

    /// `iptables -C` the rule, `-A` it only when missing.
    async fn ensure_rule(&self, table: Option<&str>, rule: &[&str]) -> Result<()> {
        let mut base: Vec<String> = Vec::new();
        if let Some(t) = table {
            base.push("-t".into());
            base.push(t.into());
        }

        let mut check = base.clone();
        check.push("-C".into());
        check.extend(rule.iter().map(|s| s.to_string()));

        let present = self
            .runner
            .run("iptables", &check)
            .await
            .map_err(|e| VmError::NetworkProvision(e.to_string()))?
            .success();
        if present {
            tracing::trace!(rule = %rule.join(" "), "iptables rule already present");
            return Ok(());
        }

        let mut add = base;
        add.push("-A".into());
        add.extend(rule.iter().map(|s| s.to_string()));
        self.step("iptables", add).await
    }
}

fn device_missing(stderr: &str) -> bool {
    let s = stderr.to_lowercase();
    s.contains("cannot find device") || s.contains("does not exist")
}

fn already_exists(stderr: &str) -> bool {
    let s = stderr.to_lowercase();
    s.contains("file exists") || s.contains("already exists") || s.contains("already assigned")
}

#[async_trait]
impl NetworkProvisioner for HostNetwork {
    async fn ensure_bridge(&self) -> Result<()> {
        let bridge = self.config.bridge.as_str();

        let exists = self
            .runner
            .run("ip", &args(["link", "show", bridge]))
            .await
            .map_err(|e| VmError::NetworkProvision(e.to_string()))?
            .success();
        if !exists {
            tracing::info!(bridge, "Creating bridge");
            self.step_tolerant("ip", args(["link", "add", "name", bridge, "type", "bridge"]))
                .await?;
        }

        let cidr = format!("{}/{}", self.config.gateway, self.config.prefix_len);
        self.step_tolerant("ip", args(["addr", "add", &cidr, "dev", bridge]))
            .await?;
        self.step("ip", args(["link", "set", bridge, "up"])).await?;

        tracing::debug!(bridge, %cidr, "Bridge ready");
        Ok(())
    }

    async fn create_tap(&self, tap: &str) -> Result<()> {
        // Stale device from an earlier VM with the same prefix; absence is fine.
        let _ = self.runner.run("ip", &args(["link", "del", tap])).await;

        let uid = self.owner_uid.to_string();
        self.step(
            "ip",
            args(["tuntap", "add", "dev", tap, "mode", "tap", "user", &uid]),
        )
        .await?;
        self.step("ip", args(["link", "set", tap, "master", &self.config.bridge]))
            .await?;
        self.step("ip", args(["link", "set", tap, "up"])).await?;

        tracing::info!(tap, bridge = %self.config.bridge, "TAP device attached");
        Ok(())
    }

    async fn enable_forwarding(&self) -> Result<()> {
        self.step("sysctl", args(["-w", "net.ipv4.ip_forward=1"]))
            .await?;

        let uplink = self.config.uplink.as_str();
        let bridge = self.config.bridge.as_str();
        self.ensure_rule(
            Some("nat"),
            &["POSTROUTING", "-o", uplink, "-j", "MASQUERADE"],
        )
        .await?;
        self.ensure_rule(None, &["FORWARD", "-i", bridge, "-j", "ACCEPT"])
            .await?;
        self.ensure_rule(None, &["FORWARD", "-o", bridge, "-j", "ACCEPT"])
            .await?;

        tracing::debug!(uplink, bridge, "Forwarding and NAT enabled");
        Ok(())
    }

    async fn delete_tap(&self, tap: &str) -> Result<()> {
        let out = self
            .runner
            .run("ip", &args(["link", "del", tap]))
            .await
            .map_err(|e| {
                tracing::warn!(tap, error = %e, "Failed to remove TAP device");
                VmError::NetworkProvision(e.to_string())
            })?;
        if out.success() {
            tracing::debug!(tap, "TAP device removed");
            return Ok(());
        }
        if device_missing(&out.stderr) {
            tracing::debug!(tap, "TAP device already gone");
            return Ok(());
        }
        tracing::warn!(tap, stderr = %out.stderr.trim(), "Failed to remove TAP device");
        Err(VmError::NetworkProvision(format!(
            "`ip link del {tap}` failed: {}",
            out.stderr.trim()
        )))
    }
}
