//! Integrity: whole-file SHA-256 fingerprints, computed in one shot or incrementally.

use sha2::{Digest, Sha256};

use crate::identity::Fingerprint;

/// Fingerprint a complete payload.
pub fn fingerprint(content: &[u8]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(content);
    Fingerprint::from_bytes(hasher.finalize().into())
}

/// Running fingerprint of content received in offset order.
///
/// Cloneable so a session can stage the state after a chunk and only commit it
/// once the chunk is acknowledged.
#[derive(Clone, Default)]
pub struct FingerprintHasher {
    hasher: Sha256,
    consumed: u64,
}

impl FingerprintHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, bytes: &[u8]) {
        self.hasher.update(bytes);
        self.consumed += bytes.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    pub fn finalize(self) -> Fingerprint {
        Fingerprint::from_bytes(self.hasher.finalize().into())
    }
}

impl std::fmt::Debug for FingerprintHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FingerprintHasher")
            .field("consumed", &self.consumed)
            .finish_non_exhaustive()
    }
}
