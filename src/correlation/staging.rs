//! Holding area for binary payloads that arrive before their request is
//! known to want them.
//!
//! Staged blobs have no expiry: one whose announcing control message never
//! arrives stays until [`BinaryStaging::clear`] (or registry close).

use std::collections::HashMap;

use bytes::Bytes;

use super::Checksum;

/// Checksum-indexed store of unclaimed payloads.
#[derive(Debug, Default)]
pub struct BinaryStaging {
    blobs: HashMap<Checksum, Bytes>,
}

impl BinaryStaging {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `bytes` under `checksum`, replacing (and returning) any blob
    /// already held for it.
    pub fn stage(&mut self, checksum: Checksum, bytes: Bytes) -> Option<Bytes> {
        self.blobs.insert(checksum, bytes)
    }

    /// Remove and return the blob for `checksum`.
    pub fn claim(&mut self, checksum: &Checksum) -> Option<Bytes> {
        self.blobs.remove(checksum)
    }

    pub fn contains(&self, checksum: &Checksum) -> bool {
        self.blobs.contains_key(checksum)
    }

    pub fn len(&self) -> usize {
        self.blobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.is_empty()
    }

    /// Total bytes held.
    pub fn staged_bytes(&self) -> usize {
        self.blobs.values().map(Bytes::len).sum()
    }

    pub fn clear(&mut self) {
        self.blobs.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_removes() {
        let mut staging = BinaryStaging::new();
        let data = Bytes::from_static(b"volume");
        let checksum = Checksum::of(&data);

        assert!(staging.stage(checksum.clone(), data.clone()).is_none());
        assert!(staging.contains(&checksum));
        assert_eq!(staging.staged_bytes(), 6);

        assert_eq!(staging.claim(&checksum), Some(data));
        assert!(staging.claim(&checksum).is_none());
        assert!(staging.is_empty());
    }

    #[test]
    fn test_one_blob_per_checksum() {
        let mut staging = BinaryStaging::new();
        let data = Bytes::from_static(b"same");
        let checksum = Checksum::of(&data);

        staging.stage(checksum.clone(), data.clone());
        assert_eq!(staging.stage(checksum, data), Some(Bytes::from_static(b"same")));
        assert_eq!(staging.len(), 1);
    }
}
