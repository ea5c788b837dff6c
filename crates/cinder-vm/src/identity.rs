//! VM identifiers and the MAC address derived from them.
//!
//! The MAC is a pure function of the id, so a VM's link-layer identity can
//! be recomputed from the id alone after a restart.

use serde::{Deserialize, Serialize};
use sha1::{Digest, Sha1};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a VM.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VmId(String);

impl VmId {
    /// Generate a new random id (32 lowercase hex characters).
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    /// Borrow the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Host TAP device name for this VM: `tap_<first 8 chars of id>`.
    pub fn tap_name(&self) -> String {
        let prefix: String = self.0.chars().take(8).collect();
        format!("tap_{prefix}")
    }

    /// Deterministic MAC address for this VM.
    pub fn mac(&self) -> MacAddr {
        MacAddr::from_id(&self.0)
    }
}

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for VmId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for VmId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A 6-byte Ethernet address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr([u8; 6]);

impl MacAddr {
    /// Derive a locally administered unicast MAC from an arbitrary id.
    ///
    /// Takes the first six bytes of SHA-1(id) and forces
    /// `byte0 = (byte0 & 0xFE) | 0x02`.
    pub fn from_id(id: &str) -> Self {
        let digest = Sha1::digest(id.as_bytes());
        let mut bytes = [0u8; 6];
        bytes.copy_from_slice(&digest[..6]);
        bytes[0] = (bytes[0] & 0xfe) | 0x02;
        Self(bytes)
    }

    /// Raw octets.
    pub fn octets(&self) -> [u8; 6] {
        self.0
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl Serialize for MacAddr {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Identity of a VM: its id and the MAC derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VmIdentity {
    /// Opaque id
    pub id: VmId,
    /// MAC derived from `id`
    pub mac: MacAddr,
}

impl VmIdentity {
    /// Generate a fresh identity.
    pub fn generate() -> Self {
        Self::from_id(VmId::generate())
    }

    /// Rebuild the identity of an existing VM.
    pub fn from_id(id: VmId) -> Self {
        let mac = id.mac();
        Self { id, mac }
    }
}
