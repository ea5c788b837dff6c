//! Guest IP allocation from the `172.16.0.0/24` pool.

use crate::error::{CoreError, Result};
use crate::store::StateStore;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Store key holding the set of assigned guest addresses.
pub const ALLOCATED_IPS_KEY: &str = "allocated_ips";

/// First assignable host octet (`.1` is the bridge).
const FIRST_OCTET: u8 = 2;

/// Last assignable host octet (`.255` is broadcast).
const LAST_OCTET: u8 = 254;

/// Hands out guest addresses `172.16.0.2 ..= 172.16.0.254`.
///
/// Each candidate is claimed with a single atomic `set_add`, so concurrent
/// allocators (in this process or another) never receive the same address.
#[derive(Clone)]
pub struct IpAllocator {
    store: Arc<dyn StateStore>,
}

impl IpAllocator {
    /// Create an allocator over `store`.
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }

    /// Number of addresses in the pool.
    pub const fn capacity() -> usize {
        (LAST_OCTET - FIRST_OCTET + 1) as usize
    }

    /// Whether `ip` belongs to the guest pool.
    pub fn in_pool(ip: Ipv4Addr) -> bool {
        let [a, b, c, d] = ip.octets();
        a == 172 && b == 16 && c == 0 && (FIRST_OCTET..=LAST_OCTET).contains(&d)
    }

    /// Claim the lowest free address.
    ///
    /// # Errors
    ///
    /// [`CoreError::PoolExhausted`] when all 253 addresses are taken.
    pub async fn allocate(&self) -> Result<Ipv4Addr> {
        for octet in FIRST_OCTET..=LAST_OCTET {
            let ip = Ipv4Addr::new(172, 16, 0, octet);
            if self.store.set_add(ALLOCATED_IPS_KEY, &ip.to_string()).await? {
                tracing::debug!(%ip, "Allocated guest IP");
                return Ok(ip);
            }
        }
        tracing::warn!("Guest IP pool exhausted");
        Err(CoreError::PoolExhausted("172.16.0.0/24".into()))
    }

    /// Return `ip` to the pool. Releasing a free address is a no-op.
    pub async fn release(&self, ip: Ipv4Addr) -> Result<()> {
        let removed = self
            .store
            .set_remove(ALLOCATED_IPS_KEY, &ip.to_string())
            .await?;
        tracing::debug!(%ip, removed, "Released guest IP");
        Ok(())
    }

    /// Whether `ip` is currently assigned.
    pub async fn is_allocated(&self, ip: Ipv4Addr) -> Result<bool> {
        self.store
            .set_contains(ALLOCATED_IPS_KEY, &ip.to_string())
            .await
    }

    /// Currently assigned addresses, sorted.
    pub async fn allocated(&self) -> Result<Vec<Ipv4Addr>> {
        let mut ips: Vec<Ipv4Addr> = self
            .store
            .set_members(ALLOCATED_IPS_KEY)
            .await?
            .iter()
            .filter_map(|s| s.parse().ok())
            .collect();
        ips.sort();
        Ok(ips)
    }
}
