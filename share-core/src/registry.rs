//! Peer registry: connected peers, the files each one offers, and liveness.
//!
//! Records live in a sharded map keyed by peer ID, so mutations of one peer never
//! wait on a global lock and are visible to the next lookup from any thread.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::{P2pError, Result};
use crate::identity::{FileRef, PeerId};

/// Registry entry for one connected peer. Only the registry mutates it.
#[derive(Debug, Clone)]
pub struct PeerRecord {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
    pub offers: HashMap<String, FileRef>,
    pub last_seen: Instant,
    /// Registry-wide sequence of the last refresh; orders peers with equal timestamps.
    seen_seq: u64,
}

/// Snapshot of a peer handed out by lookups.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerInfo {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
}

/// Anything that can name candidate sources for a file.
pub trait SourceDirectory {
    /// Peers currently offering `file`, best candidate first.
    fn find_servers(&self, file: &FileRef) -> Vec<PeerInfo>;

    /// Whether `peer` is still a valid source.
    fn is_live(&self, peer: &PeerId) -> bool;
}

#[derive(Default)]
pub struct PeerRegistry {
    peers: DashMap<PeerId, PeerRecord>,
    seq: AtomicU64,
}

impl PeerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::Relaxed)
    }

    /// Add a peer. Fails with `DuplicatePeer` while the ID is live.
    pub fn register(&self, peer_id: PeerId, addr: SocketAddr) -> Result<()> {
        match self.peers.entry(peer_id) {
            Entry::Occupied(_) => Err(P2pError::DuplicatePeer(peer_id)),
            Entry::Vacant(v) => {
                v.insert(PeerRecord {
                    peer_id,
                    addr,
                    offers: HashMap::new(),
                    last_seen: Instant::now(),
                    seen_seq: self.next_seq(),
                });
                debug!(peer = %peer_id, %addr, "peer registered");
                Ok(())
            }
        }
    }

    /// Remove a peer. Idempotent; returns the record if it was live.
    ///
    /// Callers that also own sessions go through `ShareCore::unregister_peer`, which
    /// cancels the peer's sessions as well.
    pub fn unregister(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        self.peers.remove(peer_id).map(|(_, record)| record)
    }

    /// Refresh last-seen. Returns false for unknown peers.
    pub fn touch(&self, peer_id: &PeerId) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(mut record) => {
                record.last_seen = Instant::now();
                record.seen_seq = self.next_seq();
                true
            }
            None => false,
        }
    }

    /// Record that `peer_id` can serve `file`. No-op for unknown peers.
    pub fn offer(&self, peer_id: &PeerId, file: FileRef) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(mut record) => {
                debug!(peer = %peer_id, file = %file.id, "offer");
                record.offers.insert(file.id.clone(), file);
                true
            }
            None => {
                warn!(peer = %peer_id, file = %file.id, "offer from unknown peer ignored");
                false
            }
        }
    }

    /// Stop advertising `file_id` for `peer_id`. No-op for unknown peers.
    pub fn withdraw(&self, peer_id: &PeerId, file_id: &str) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(mut record) => record.offers.remove(file_id).is_some(),
            None => {
                warn!(peer = %peer_id, file = %file_id, "withdraw from unknown peer ignored");
                false
            }
        }
    }

    /// Peers offering exactly this FileRef, most recently seen first.
    pub fn find_servers(&self, file: &FileRef) -> Vec<PeerInfo> {
        let mut found: Vec<(u64, PeerInfo)> = self
            .peers
            .iter()
            .filter(|r| r.offers.get(&file.id) == Some(file))
            .map(|r| {
                (
                    r.seen_seq,
                    PeerInfo {
                        peer_id: r.peer_id,
                        addr: r.addr,
                    },
                )
            })
            .collect();
        found.sort_by(|a, b| b.0.cmp(&a.0));
        found.into_iter().map(|(_, info)| info).collect()
    }

    /// Most recently refreshed offer for an identifier.
    pub fn resolve(&self, file_id: &str) -> Option<FileRef> {
        self.peers
            .iter()
            .filter_map(|r| r.offers.get(file_id).map(|f| (r.seen_seq, f.clone())))
            .max_by_key(|(seq, _)| *seq)
            .map(|(_, f)| f)
    }

    /// Peers whose last refresh is older than `timeout` at `now`.
    pub fn expired(&self, now: Instant, timeout: Duration) -> Vec<PeerId> {
        self.peers
            .iter()
            .filter(|r| now.saturating_duration_since(r.last_seen) >= timeout)
            .map(|r| r.peer_id)
            .collect()
    }

    pub fn get(&self, peer_id: &PeerId) -> Option<PeerInfo> {
        self.peers.get(peer_id).map(|r| PeerInfo {
            peer_id: r.peer_id,
            addr: r.addr,
        })
    }

    pub fn contains(&self, peer_id: &PeerId) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl SourceDirectory for PeerRegistry {
    fn find_servers(&self, file: &FileRef) -> Vec<PeerInfo> {
        PeerRegistry::find_servers(self, file)
    }

    fn is_live(&self, peer: &PeerId) -> bool {
        self.contains(peer)
    }
}

/// Fixed candidate list, e.g. the answer of a remote lookup.
#[derive(Debug, Clone, Default)]
pub struct Candidates(pub Vec<PeerInfo>);

impl Candidates {
    /// Append peers not already listed, keeping order.
    pub fn extend_unique(&mut self, more: impl IntoIterator<Item = PeerInfo>) {
        for peer in more {
            if !self.0.iter().any(|p| p.peer_id == peer.peer_id) {
                self.0.push(peer);
            }
        }
    }
}

impl SourceDirectory for Candidates {
    fn find_servers(&self, _file: &FileRef) -> Vec<PeerInfo> {
        self.0.clone()
    }

    fn is_live(&self, peer: &PeerId) -> bool {
        self.0.iter().any(|p| p.peer_id == *peer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::Rng;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn peer(port: u16) -> PeerId {
        PeerId::generate(&addr(port))
    }

    #[test]
    fn duplicate_register_fails() {
        let reg = PeerRegistry::new();
        let a = peer(1);
        reg.register(a, addr(1)).unwrap();
        assert_eq!(reg.register(a, addr(2)), Err(P2pError::DuplicatePeer(a)));
        assert_eq!(reg.get(&a).unwrap().addr, addr(1));
    }

    #[test]
    fn unregister_is_idempotent() {
        let reg = PeerRegistry::new();
        let a = peer(1);
        reg.register(a, addr(1)).unwrap();
        assert!(reg.unregister(&a).is_some());
        assert!(reg.unregister(&a).is_none());
        assert!(reg.is_empty());
        // The ID may be registered again afterwards.
        reg.register(a, addr(1)).unwrap();
    }

    #[test]
    fn offer_from_unknown_peer_is_noop() {
        let reg = PeerRegistry::new();
        let file = FileRef::from_content("f1", b"x");
        assert!(!reg.offer(&peer(1), file.clone()));
        assert!(!reg.withdraw(&peer(1), "f1"));
        assert!(reg.find_servers(&file).is_empty());
    }

    #[test]
    fn find_servers_orders_by_recency() {
        let reg = PeerRegistry::new();
        let file = FileRef::from_content("f1", b"content");
        let (a, b, c) = (peer(1), peer(2), peer(3));
        for (p, port) in [(a, 1), (b, 2), (c, 3)] {
            reg.register(p, addr(port)).unwrap();
            reg.offer(&p, file.clone());
        }
        let order: Vec<PeerId> = reg.find_servers(&file).iter().map(|p| p.peer_id).collect();
        assert_eq!(order, vec![c, b, a]);

        reg.touch(&a);
        let order: Vec<PeerId> = reg.find_servers(&file).iter().map(|p| p.peer_id).collect();
        assert_eq!(order, vec![a, c, b]);
    }

    #[test]
    fn find_servers_requires_matching_fingerprint() {
        let reg = PeerRegistry::new();
        let a = peer(1);
        reg.register(a, addr(1)).unwrap();
        reg.offer(&a, FileRef::from_content("f1", b"old"));
        assert!(reg
            .find_servers(&FileRef::from_content("f1", b"new"))
            .is_empty());
    }

    #[test]
    fn withdraw_removes_offer() {
        let reg = PeerRegistry::new();
        let a = peer(1);
        let file = FileRef::from_content("f1", b"x");
        reg.register(a, addr(1)).unwrap();
        reg.offer(&a, file.clone());
        assert_eq!(reg.resolve("f1"), Some(file.clone()));
        assert!(reg.withdraw(&a, "f1"));
        assert!(reg.find_servers(&file).is_empty());
        assert_eq!(reg.resolve("f1"), None);
    }

    #[test]
    fn expired_uses_timeout() {
        let reg = PeerRegistry::new();
        let a = peer(1);
        reg.register(a, addr(1)).unwrap();
        let timeout = Duration::from_secs(16);
        assert!(reg.expired(Instant::now(), timeout).is_empty());
        assert_eq!(reg.expired(Instant::now() + timeout, timeout), vec![a]);
    }

    #[test]
    fn never_reports_unregistered_source() {
        let reg = PeerRegistry::new();
        let file = FileRef::from_content("f1", b"shared");
        let peers: Vec<PeerId> = (0..8).map(|i| peer(100 + i)).collect();
        let mut live = std::collections::HashSet::new();
        let mut rng = rand::thread_rng();
        for _ in 0..2_000 {
            let p = peers[rng.gen_range(0..peers.len())];
            if rng.gen_bool(0.5) {
                if reg.register(p, addr(1)).is_ok() {
                    reg.offer(&p, file.clone());
                    live.insert(p);
                }
            } else {
                reg.unregister(&p);
                live.remove(&p);
            }
            for server in reg.find_servers(&file) {
                assert!(live.contains(&server.peer_id));
            }
        }
    }

    #[test]
    fn concurrent_unregister_is_visible() {
        use std::sync::Arc;
        let reg = Arc::new(PeerRegistry::new());
        let file = FileRef::from_content("f1", b"shared");
        let handles: Vec<_> = (0..4u16)
            .map(|t| {
                let reg = reg.clone();
                let file = file.clone();
                std::thread::spawn(move || {
                    for i in 0..200u16 {
                        let p = peer(t * 1000 + i);
                        reg.register(p, addr(1)).unwrap();
                        reg.offer(&p, file.clone());
                        reg.unregister(&p);
                        assert!(reg.find_servers(&file).iter().all(|s| s.peer_id != p));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert!(reg.is_empty());
    }

    #[test]
    fn candidates_dedupe() {
        let (a, b) = (peer(1), peer(2));
        let mut c = Candidates::default();
        c.extend_unique([
            PeerInfo { peer_id: a, addr: addr(1) },
            PeerInfo { peer_id: b, addr: addr(2) },
            PeerInfo { peer_id: a, addr: addr(3) },
        ]);
        assert_eq!(c.0.len(), 2);
        assert!(c.is_live(&b));
    }
}
