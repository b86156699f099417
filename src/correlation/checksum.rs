//! Content checksum used to pair binary payloads with their requests.

use std::fmt;

use sha2::{Digest, Sha256};

/// Lowercase hex SHA-256 of a payload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Checksum(String);

impl Checksum {
    /// Hash `data`.
    pub fn of(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Checksum(hex::encode(hasher.finalize()))
    }

    /// Wrap a checksum announced by the remote side. Hex case is ignored.
    pub fn from_hex(hex: &str) -> Self {
        Checksum(hex.trim().to_ascii_lowercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
