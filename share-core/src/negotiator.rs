//! Transfer negotiation: pick a source peer for a destination and establish (or
//! resume) the destination-side session.
//!
//! Negotiation is split so the host can do network I/O between the steps:
//! `begin` validates the request and orders candidates, `conclude` binds a
//! session to the candidate being dialed, `abandon` cleans up when every
//! candidate failed. The session stays `negotiating` (or `paused`) until the
//! host calls `activate` after the source accepted.

use tracing::debug;

use crate::config::Config;
use crate::error::{P2pError, Result};
use crate::identity::{FileRef, PeerId};
use crate::integrity::FingerprintHasher;
use crate::registry::{PeerInfo, SourceDirectory};
use crate::session::{FailureReason, Role, SessionStatus, SessionTable, SharedSession, TransferSession};
use crate::store::ChunkStore;

/// An in-progress negotiation.
#[derive(Debug)]
pub struct Negotiation {
    destination: PeerId,
    file: FileRef,
    offset: u64,
    candidates: Vec<PeerInfo>,
    session: Option<SharedSession>,
    created: bool,
}

impl Negotiation {
    /// Sources to try, in order.
    pub fn candidates(&self) -> &[PeerInfo] {
        &self.candidates
    }

    /// Offset the transfer (re)starts from.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether an existing paused session is being resumed.
    pub fn is_resume(&self) -> bool {
        self.session.is_some() && !self.created
    }
}

pub struct Negotiator<'a> {
    sessions: &'a SessionTable,
    store: &'a dyn ChunkStore,
    config: &'a Config,
}

impl<'a> Negotiator<'a> {
    pub fn new(sessions: &'a SessionTable, store: &'a dyn ChunkStore, config: &'a Config) -> Self {
        Self {
            sessions,
            store,
            config,
        }
    }

    /// Validate a request for `file` at `resume_offset` and order candidate sources.
    pub fn begin(
        &self,
        directory: &dyn SourceDirectory,
        destination: PeerId,
        file: &FileRef,
        resume_offset: u64,
    ) -> Result<Negotiation> {
        let mut resume: Option<(SharedSession, PeerId)> = None;
        if let Some(shared) = self.sessions.find(Role::Destination, destination, &file.id) {
            let (id, status, acked, source, same_file) = {
                let s = shared.lock();
                (s.id(), s.status(), s.acked(), s.source_peer(), s.file() == file)
            };
            match status {
                s if s.is_terminal() => {
                    self.sessions.remove(&id);
                }
                SessionStatus::Paused if same_file && resume_offset == acked => {
                    resume = Some((shared, source));
                }
                SessionStatus::Paused if same_file && resume_offset < acked => {
                    // Restart from an earlier offset: retire the old session.
                    debug!(session = %id, from = acked, to = resume_offset, "retiring session for earlier resume");
                    self.sessions.remove(&id);
                    shared.lock().fail(FailureReason::Cancelled);
                }
                SessionStatus::Paused if same_file => {
                    return Err(P2pError::InvalidResume {
                        offset: resume_offset,
                        limit: acked,
                    });
                }
                _ => return Err(P2pError::SessionAlreadyActive(file.id.clone())),
            }
        }

        let mut candidates: Vec<PeerInfo> = directory
            .find_servers(file)
            .into_iter()
            .filter(|p| p.peer_id != destination)
            .collect();

        if let Some((shared, source)) = resume {
            if directory.is_live(&source) {
                if let Some(pos) = candidates.iter().position(|p| p.peer_id == source) {
                    let current = candidates.remove(pos);
                    candidates.insert(0, current);
                }
            } else {
                debug!(peer = %source, file = %file.id, "previous source gone, reselecting");
            }
            if candidates.is_empty() {
                return Err(P2pError::NoSourceAvailable(file.id.clone()));
            }
            return Ok(Negotiation {
                destination,
                file: file.clone(),
                offset: resume_offset,
                candidates,
                session: Some(shared),
                created: false,
            });
        }

        if resume_offset > file.size {
            return Err(P2pError::InvalidResume {
                offset: resume_offset,
                limit: file.size,
            });
        }
        if resume_offset > 0 {
            let held = self.store.partial_len(file);
            if resume_offset > held {
                return Err(P2pError::InvalidResume {
                    offset: resume_offset,
                    limit: held,
                });
            }
        }
        if candidates.is_empty() {
            return Err(P2pError::NoSourceAvailable(file.id.clone()));
        }
        Ok(Negotiation {
            destination,
            file: file.clone(),
            offset: resume_offset,
            candidates,
            session: None,
            created: false,
        })
    }

    /// Bind the negotiation's session to `chosen`, creating it on first use.
    pub fn conclude(&self, negotiation: &mut Negotiation, chosen: &PeerInfo) -> Result<SharedSession> {
        if let Some(shared) = &negotiation.session {
            shared.lock().rebind_source(chosen.peer_id);
            return Ok(shared.clone());
        }
        let hasher = self.seed_hasher(&negotiation.file, negotiation.offset)?;
        let session = TransferSession::destination(
            negotiation.file.clone(),
            chosen.peer_id,
            negotiation.destination,
            negotiation.offset,
            self.config.chunk_size(),
            self.config.retry_limit,
            hasher,
        );
        let shared = self.sessions.insert(session)?;
        negotiation.session = Some(shared.clone());
        negotiation.created = true;
        Ok(shared)
    }

    /// Every candidate failed. A session created by this negotiation is dropped; a
    /// resumed one is left paused for the caller's retry policy.
    pub fn abandon(&self, negotiation: Negotiation) -> P2pError {
        if let (true, Some(shared)) = (negotiation.created, &negotiation.session) {
            let id = shared.lock().id();
            self.sessions.remove(&id);
            shared.lock().fail(FailureReason::Cancelled);
        }
        P2pError::NoSourceAvailable(negotiation.file.id)
    }

    /// Full negotiation with a synchronous handshake: try candidates in order until
    /// one accepts, then activate the session.
    pub fn negotiate<F>(
        &self,
        directory: &dyn SourceDirectory,
        destination: PeerId,
        file: &FileRef,
        resume_offset: u64,
        mut handshake: F,
    ) -> Result<SharedSession>
    where
        F: FnMut(&PeerInfo, u64) -> Result<()>,
    {
        let mut negotiation = self.begin(directory, destination, file, resume_offset)?;
        let candidates = negotiation.candidates().to_vec();
        for candidate in &candidates {
            let shared = self.conclude(&mut negotiation, candidate)?;
            match handshake(candidate, negotiation.offset) {
                Ok(()) => {
                    shared.lock().activate();
                    return Ok(shared);
                }
                Err(e) => {
                    debug!(peer = %candidate.peer_id, error = %e, "candidate failed, trying next");
                }
            }
        }
        Err(self.abandon(negotiation))
    }

    /// Running fingerprint over the partial content already held below `offset`.
    fn seed_hasher(&self, file: &FileRef, offset: u64) -> Result<FingerprintHasher> {
        let mut hasher = FingerprintHasher::new();
        let step = self.config.chunk_size();
        let mut pos = 0;
        while pos < offset {
            let len = step.min(offset - pos);
            hasher.update(&self.store.read_partial(file, pos, len)?);
            pos += len;
        }
        Ok(hasher)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::PeerRegistry;
    use crate::store::MemoryStore;
    use std::net::SocketAddr;

    struct Fixture {
        registry: PeerRegistry,
        sessions: SessionTable,
        store: MemoryStore,
        config: Config,
        me: PeerId,
    }

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                registry: PeerRegistry::new(),
                sessions: SessionTable::new(),
                store: MemoryStore::new(),
                config: Config {
                    chunk_size: 4096,
                    ..Config::default()
                },
                me: PeerId::generate(&addr(1)),
            }
        }

        fn negotiator(&self) -> Negotiator<'_> {
            Negotiator::new(&self.sessions, &self.store, &self.config)
        }

        fn source(&self, port: u16, file: &FileRef) -> PeerId {
            let id = PeerId::generate(&addr(port));
            self.registry.register(id, addr(port)).unwrap();
            self.registry.offer(&id, file.clone());
            id
        }
    }

    fn file() -> FileRef {
        FileRef::from_content("f1", &vec![3u8; 10_000])
    }

    #[test]
    fn no_servers_is_no_source_available() {
        let fx = Fixture::new();
        let err = fx
            .negotiator()
            .begin(&fx.registry, fx.me, &file(), 0)
            .unwrap_err();
        assert_eq!(err, P2pError::NoSourceAvailable("f1".into()));
    }

    #[test]
    fn destination_is_never_its_own_candidate() {
        let fx = Fixture::new();
        let f = file();
        fx.registry.register(fx.me, addr(1)).unwrap();
        fx.registry.offer(&fx.me, f.clone());
        assert!(fx.negotiator().begin(&fx.registry, fx.me, &f, 0).is_err());
    }

    #[test]
    fn failed_candidate_falls_through() {
        let fx = Fixture::new();
        let f = file();
        let a = fx.source(2, &f);
        let b = fx.source(3, &f);
        let mut tried = Vec::new();
        let shared = fx
            .negotiator()
            .negotiate(&fx.registry, fx.me, &f, 0, |peer, _| {
                tried.push(peer.peer_id);
                if peer.peer_id == b {
                    Err(P2pError::NoSourceAvailable("f1".into()))
                } else {
                    Ok(())
                }
            })
            .unwrap();
        // b registered last, so it is tried first.
        assert_eq!(tried, vec![b, a]);
        let s = shared.lock();
        assert_eq!(s.source_peer(), a);
        assert_eq!(s.status(), SessionStatus::Active);
        assert_eq!(fx.sessions.len(), 1);
    }

    #[test]
    fn exhausted_candidates_leave_no_session() {
        let fx = Fixture::new();
        let f = file();
        fx.source(2, &f);
        fx.source(3, &f);
        let err = fx
            .negotiator()
            .negotiate(&fx.registry, fx.me, &f, 0, |_, _| {
                Err(P2pError::NoSourceAvailable("f1".into()))
            })
            .unwrap_err();
        assert_eq!(err, P2pError::NoSourceAvailable("f1".into()));
        assert!(fx.sessions.is_empty());
    }

    #[test]
    fn active_session_rejects_duplicate_request() {
        let fx = Fixture::new();
        let f = file();
        fx.source(2, &f);
        fx.negotiator()
            .negotiate(&fx.registry, fx.me, &f, 0, |_, _| Ok(()))
            .unwrap();
        assert_eq!(
            fx.negotiator().begin(&fx.registry, fx.me, &f, 0).unwrap_err(),
            P2pError::SessionAlreadyActive("f1".into())
        );
    }

    #[test]
    fn paused_session_resumes_with_same_source_first() {
        let fx = Fixture::new();
        let f = file();
        let a = fx.source(2, &f);
        let first = fx
            .negotiator()
            .negotiate(&fx.registry, fx.me, &f, 0, |_, _| Ok(()))
            .unwrap();
        fx.source(3, &f);
        assert!(first.lock().pause());

        let again = fx
            .negotiator()
            .negotiate(&fx.registry, fx.me, &f, 0, |peer, offset| {
                assert_eq!(peer.peer_id, a);
                assert_eq!(offset, 0);
                Ok(())
            })
            .unwrap();
        assert!(std::sync::Arc::ptr_eq(&first, &again));
        assert_eq!(again.lock().status(), SessionStatus::Active);
    }

    #[test]
    fn paused_session_reselects_when_source_gone() {
        let fx = Fixture::new();
        let f = file();
        let a = fx.source(2, &f);
        let first = fx
            .negotiator()
            .negotiate(&fx.registry, fx.me, &f, 0, |_, _| Ok(()))
            .unwrap();
        first.lock().pause();
        fx.registry.unregister(&a);
        let b = fx.source(3, &f);

        let again = fx
            .negotiator()
            .negotiate(&fx.registry, fx.me, &f, 0, |_, _| Ok(()))
            .unwrap();
        assert!(std::sync::Arc::ptr_eq(&first, &again));
        assert_eq!(again.lock().source_peer(), b);
    }

    #[test]
    fn resume_beyond_acked_is_invalid() {
        let fx = Fixture::new();
        let f = file();
        fx.source(2, &f);
        let first = fx
            .negotiator()
            .negotiate(&fx.registry, fx.me, &f, 0, |_, _| Ok(()))
            .unwrap();
        first.lock().pause();
        assert_eq!(
            fx.negotiator().begin(&fx.registry, fx.me, &f, 4096).unwrap_err(),
            P2pError::InvalidResume {
                offset: 4096,
                limit: 0
            }
        );
    }

    #[test]
    fn fresh_resume_seeds_fingerprint_from_partial() {
        let fx = Fixture::new();
        let data: Vec<u8> = (0..10_000u32).map(|i| (i % 7) as u8).collect();
        let f = FileRef::from_content("f1", &data);
        fx.source(2, &f);
        fx.store.write_range(&f, 0, &data[..4096]).unwrap();

        assert!(matches!(
            fx.negotiator().begin(&fx.registry, fx.me, &f, 8192),
            Err(P2pError::InvalidResume { limit: 4096, .. })
        ));

        let shared = fx
            .negotiator()
            .negotiate(&fx.registry, fx.me, &f, 4096, |_, offset| {
                assert_eq!(offset, 4096);
                Ok(())
            })
            .unwrap();
        let mut s = shared.lock();
        assert_eq!(s.acked(), 4096);
        while let crate::session::Pull::Range(range) = s.pull().unwrap() {
            let chunk = crate::chunk::Chunk::new(
                range.offset,
                data[range.offset as usize..range.end() as usize].to_vec(),
            );
            s.receive(&chunk).unwrap();
            s.ack(chunk.end()).unwrap();
        }
        s.finish().unwrap();
    }

    #[test]
    fn earlier_resume_retires_paused_session() {
        let fx = Fixture::new();
        let f = file();
        fx.source(2, &f);
        let first = fx
            .negotiator()
            .negotiate(&fx.registry, fx.me, &f, 0, |_, _| Ok(()))
            .unwrap();
        {
            let mut s = first.lock();
            s.receive(&crate::chunk::Chunk::new(0, vec![3u8; 4096])).unwrap();
            s.ack(4096).unwrap();
            s.pause();
        }
        let again = fx
            .negotiator()
            .negotiate(&fx.registry, fx.me, &f, 0, |_, _| Ok(()))
            .unwrap();
        assert!(!std::sync::Arc::ptr_eq(&first, &again));
        assert_eq!(
            first.lock().status(),
            SessionStatus::Failed(FailureReason::Cancelled)
        );
        assert_eq!(again.lock().acked(), 0);
        assert_eq!(fx.sessions.len(), 1);
    }
}
