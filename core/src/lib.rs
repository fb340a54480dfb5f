//! Core types shared across the certhunt engine.

pub mod clock;
pub mod report;

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use sha2::{Digest, Sha256};

pub const fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Unix timestamp (seconds) of the current local time.
pub fn now_unix() -> i64 {
    time::OffsetDateTime::now_utc().unix_timestamp()
}

/// IP protocol family of a hunting target or a public-IP observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IpVersion {
    V4,
    V6,
}

impl IpVersion {
    /// Number of bytes an address of this family occupies on the wire.
    pub fn addr_len(self) -> usize {
        match self {
            IpVersion::V4 => 4,
            IpVersion::V6 => 16,
        }
    }

    pub fn of(ip: &IpAddr) -> Self {
        if ip.is_ipv4() {
            IpVersion::V4
        } else {
            IpVersion::V6
        }
    }
}

impl fmt::Display for IpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpVersion::V4 => write!(f, "4"),
            IpVersion::V6 => write!(f, "6"),
        }
    }
}

/// SHA-256 digest of a DER-encoded certificate.
///
/// Equality is over the full 32-byte array; there is no truncated or prefix
/// comparison anywhere in the system.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct CertHash(pub [u8; 32]);

impl CertHash {
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Display for CertHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

impl fmt::Debug for CertHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CertHash({})", self)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid certificate hash: {0}")]
pub struct ParseHashError(String);

impl FromStr for CertHash {
    type Err = ParseHashError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| ParseHashError(s.to_string()))?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| ParseHashError(s.to_string()))?;
        Ok(CertHash(arr))
    }
}

/// SHA-256 over a byte slice.
pub fn sha256(data: &[u8]) -> CertHash {
    let mut hasher = Sha256::new();
    hasher.update(data);
    CertHash(hasher.finalize().into())
}
