//! dSUID: deterministic 17-byte entity identifiers, rendered as 34 hex chars.
//!
//! ## Layout
//!
//! ```text
//! Bytes 0-3:   Namespace tag      (host / connector / device)
//! Bytes 4-13:  Identifier hash    (SHA-256 prefix of "vendor:identifier")
//! Bytes 14-15: Reserved           (zero)
//! Byte 16:     Enumeration        (0 for single entity, 1-255 for siblings)
//! ```
//!
//! Generation is a pure function of its inputs: the same (namespace, vendor,
//! identifier, enumeration) always yields the same dSUID. Parsing accepts
//! either case and tolerates `-` and `:` separators; the canonical rendering
//! is 34 uppercase hex characters without separators.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Length of a dSUID in bytes.
pub const DSUID_LEN: usize = 17;

/// Number of identifier-hash bytes taken from the content digest.
const HASH_LEN: usize = 10;

/// Entity class a dSUID belongs to, encoded in the 4-byte namespace tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Namespace {
    /// The vDC host process itself.
    Host,
    /// A connector (one per upstream technology or gateway).
    Connector,
    /// An individual addressable device.
    Device,
}

impl Namespace {
    fn tag(self) -> [u8; 4] {
        match self {
            Namespace::Host => [0x00, 0x00, 0x00, 0x00],
            Namespace::Connector => [0x00, 0x00, 0x00, 0x01],
            Namespace::Device => [0x00, 0x00, 0x00, 0x02],
        }
    }
}

/// Errors when parsing a dSUID from text.
#[derive(Debug, Error)]
pub enum DsUidError {
    #[error("invalid dSUID length: expected 34 hex chars, got {0}")]
    InvalidLength(usize),

    #[error("invalid hex character in dSUID")]
    InvalidHex,
}

/// A 17-byte deterministic entity identifier.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DsUid([u8; DSUID_LEN]);

impl DsUid {
    /// Derive a dSUID from its logical inputs.
    ///
    /// The identifier hash is the first 10 bytes of
    /// `SHA-256("{vendor}:{identifier}")`, so siblings with the same hardware
    /// key differ only in the enumeration byte.
    pub fn derive(namespace: Namespace, vendor: &str, identifier: &str, enumeration: u8) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(vendor.as_bytes());
        hasher.update(b":");
        hasher.update(identifier.as_bytes());
        let digest = hasher.finalize();

        let mut bytes = [0u8; DSUID_LEN];
        bytes[0..4].copy_from_slice(&namespace.tag());
        bytes[4..4 + HASH_LEN].copy_from_slice(&digest[..HASH_LEN]);
        // bytes 14..16 stay reserved-zero
        bytes[16] = enumeration;
        Self(bytes)
    }

    /// Derive a host dSUID from the host's MAC-like identity string.
    pub fn host(vendor: &str, identity: &str) -> Self {
        Self::derive(Namespace::Host, vendor, identity, 0)
    }

    /// Derive a connector dSUID. The connector index doubles as enumeration.
    pub fn connector(vendor: &str, identity: &str, index: u8) -> Self {
        let identifier = format!("{identity}:{index}");
        Self::derive(Namespace::Connector, vendor, &identifier, index)
    }

    /// Derive a device dSUID from its hardware key.
    pub fn device(vendor: &str, hardware_key: &str, enumeration: u8) -> Self {
        Self::derive(Namespace::Device, vendor, hardware_key, enumeration)
    }

    /// Same base identifier under a different enumeration byte.
    pub fn with_enumeration(mut self, enumeration: u8) -> Self {
        self.0[16] = enumeration;
        self
    }

    /// The enumeration byte distinguishing sibling entities.
    pub fn enumeration(&self) -> u8 {
        self.0[16]
    }

    /// Raw bytes.
    pub fn as_bytes(&self) -> &[u8; DSUID_LEN] {
        &self.0
    }

    /// Canonical rendering: 34 uppercase hex characters.
    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }
}

impl fmt::Display for DsUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for DsUid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DsUid({})", self.to_hex())
    }
}

impl FromStr for DsUid {
    type Err = DsUidError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let clean: String = s.chars().filter(|c| *c != '-' && *c != ':').collect();
        if clean.len() != 2 * DSUID_LEN {
            return Err(DsUidError::InvalidLength(clean.len()));
        }
        let raw = hex::decode(&clean).map_err(|_| DsUidError::InvalidHex)?;
        let mut bytes = [0u8; DSUID_LEN];
        bytes.copy_from_slice(&raw);
        Ok(Self(bytes))
    }
}

impl Serialize for DsUid {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for DsUid {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
