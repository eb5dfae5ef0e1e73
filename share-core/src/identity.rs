//! Peer and file identity: peer IDs, content fingerprints, file references.

use std::fmt;
use std::net::SocketAddr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Peer ID (16 bytes). Flat identifier; whether a peer is source or destination
/// is a property of a transfer session, never of the peer.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct PeerId(#[serde(with = "bytes_16")] [u8; 16]);

mod bytes_16 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 16], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 16], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 16 bytes"))
    }
}

impl PeerId {
    /// Derive a fresh peer ID from an address and a random nonce. Two calls with the
    /// same address never collide in practice, so a reconnecting peer is a new peer.
    pub fn generate(addr: &SocketAddr) -> Self {
        let nonce = uuid::Uuid::new_v4();
        let mut hasher = Sha256::new();
        hasher.update(addr.to_string().as_bytes());
        hasher.update(nonce.as_bytes());
        let digest = hasher.finalize();
        let mut id = [0u8; 16];
        id.copy_from_slice(&digest[..16]);
        PeerId(id)
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        PeerId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Short form is enough to tell peers apart in logs.
        f.write_str(&hex::encode(&self.0[..6]))
    }
}

/// SHA-256 digest of a file's full content.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct Fingerprint(#[serde(with = "bytes_32")] [u8; 32]);

mod bytes_32 {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    pub fn serialize<S: Serializer>(v: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        v.as_slice().serialize(serializer)
    }
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 32], D::Error> {
        let buf: Vec<u8> = Deserialize::deserialize(d)?;
        buf.try_into()
            .map_err(|_| serde::de::Error::custom("expected 32 bytes"))
    }
}

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Fingerprint(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Identity of a shareable file. Immutable once published: a changed file is a new FileRef.
#[derive(Debug, Clone, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub struct FileRef {
    pub id: String,
    pub size: u64,
    pub fingerprint: Fingerprint,
}

impl FileRef {
    pub fn new(id: impl Into<String>, size: u64, fingerprint: Fingerprint) -> Self {
        Self {
            id: id.into(),
            size,
            fingerprint,
        }
    }

    /// Build a FileRef by hashing the full content.
    pub fn from_content(id: impl Into<String>, content: &[u8]) -> Self {
        Self::new(id, content.len() as u64, crate::integrity::fingerprint(content))
    }
}

impl fmt::Display for FileRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} bytes)", self.id, self.size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> SocketAddr {
        "127.0.0.1:45679".parse().unwrap()
    }

    #[test]
    fn same_address_yields_distinct_ids() {
        let a = PeerId::generate(&addr());
        let b = PeerId::generate(&addr());
        assert_ne!(a, b);
    }

    #[test]
    fn peer_id_bytes_roundtrip() {
        let id = PeerId::generate(&addr());
        assert_eq!(PeerId::from_bytes(*id.as_bytes()), id);
    }

    #[test]
    fn file_ref_from_content_matches_size_and_hash() {
        let file = FileRef::from_content("f1", b"hello world");
        assert_eq!(file.size, 11);
        assert_eq!(file.fingerprint, crate::integrity::fingerprint(b"hello world"));
        assert_ne!(file, FileRef::from_content("f1", b"hello world!"));
    }

    #[test]
    fn fingerprint_hex_is_full_digest() {
        let fp = crate::integrity::fingerprint(b"");
        assert_eq!(fp.to_hex().len(), 64);
        assert!(fp
            .to_hex()
            .starts_with("e3b0c44298fc1c149afbf4c8996fb924"));
    }
}
