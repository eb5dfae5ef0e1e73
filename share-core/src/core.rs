//! Node coordinator: owns registry, session table, store and config, and is the
//! single place where peer removal cascades into session cancellation.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};

use crate::chunk::clamp_chunk_size;
use crate::config::Config;
use crate::error::{P2pError, Result};
use crate::identity::{FileRef, PeerId};
use crate::negotiator::Negotiator;
use crate::registry::{PeerRecord, PeerRegistry};
use crate::session::{Role, SessionStatus, SessionSweep, SessionTable, SharedSession, TransferSession};
use crate::store::ChunkStore;

/// Outcome of one liveness sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub evicted: Vec<PeerId>,
    pub sessions: SessionSweep,
}

pub struct ShareCore {
    local_id: PeerId,
    config: Config,
    registry: PeerRegistry,
    sessions: SessionTable,
    store: Arc<dyn ChunkStore>,
}

impl ShareCore {
    pub fn new(local_id: PeerId, config: Config, store: Arc<dyn ChunkStore>) -> Self {
        Self {
            local_id,
            config,
            registry: PeerRegistry::new(),
            sessions: SessionTable::new(),
            store,
        }
    }

    pub fn local_id(&self) -> PeerId {
        self.local_id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &PeerRegistry {
        &self.registry
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn store(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    pub fn negotiator(&self) -> Negotiator<'_> {
        Negotiator::new(&self.sessions, self.store.as_ref(), &self.config)
    }

    pub fn register_peer(&self, peer_id: PeerId, addr: SocketAddr) -> Result<()> {
        if peer_id == self.local_id {
            return Err(P2pError::DuplicatePeer(peer_id));
        }
        self.registry.register(peer_id, addr)?;
        info!(peer = %peer_id, %addr, "peer joined");
        Ok(())
    }

    /// Remove a peer and cancel every session it takes part in. Idempotent.
    /// Explicit disconnects and liveness evictions both land here.
    pub fn unregister_peer(&self, peer_id: &PeerId) -> Option<PeerRecord> {
        let record = self.registry.unregister(peer_id);
        let cancelled = self.sessions.cancel_for_peer(peer_id);
        if record.is_some() || cancelled > 0 {
            info!(peer = %peer_id, cancelled, "peer left");
        }
        record
    }

    /// Evict peers past the liveness timeout and age out idle sessions.
    pub fn sweep(&self, now: Instant) -> SweepReport {
        let evicted = self.registry.expired(now, self.config.peer_timeout());
        for peer_id in &evicted {
            debug!(peer = %peer_id, "evicting silent peer");
            self.unregister_peer(peer_id);
        }
        let sessions = self.sessions.sweep(
            now,
            self.config.idle_timeout(),
            self.config.resume_window(),
        );
        SweepReport { evicted, sessions }
    }

    /// Whether this node can serve `file` from its own store.
    pub fn holds(&self, file: &FileRef) -> bool {
        self.store.lookup(&file.id).as_ref() == Some(file)
    }

    /// FileRef for an identifier: local catalog first, then peers' offers.
    pub fn resolve(&self, file_id: &str) -> Option<FileRef> {
        self.store
            .lookup(file_id)
            .or_else(|| self.registry.resolve(file_id))
    }

    /// Source side of a handshake: admit `destination` for `file` from
    /// `resume_offset`, resuming a paused session on the same route if there is one.
    /// The returned session is active.
    pub fn accept_transfer(
        &self,
        destination: PeerId,
        file: &FileRef,
        resume_offset: u64,
        chunk_size: u64,
    ) -> Result<SharedSession> {
        if !self.holds(file) {
            return Err(P2pError::NoSourceAvailable(file.id.clone()));
        }
        if resume_offset > file.size {
            return Err(P2pError::InvalidResume {
                offset: resume_offset,
                limit: file.size,
            });
        }
        self.registry.touch(&destination);

        if let Some(shared) = self.sessions.find(Role::Source, destination, &file.id) {
            let mut s = shared.lock();
            if s.status() == SessionStatus::Paused && s.file() == file {
                s.rewind(resume_offset)?;
                s.activate();
                debug!(session = %s.id(), offset = resume_offset, "source session resumed");
                drop(s);
                return Ok(shared);
            }
        }

        let chunk_size = if chunk_size == 0 {
            self.config.chunk_size()
        } else {
            clamp_chunk_size(chunk_size)
        };
        let session = TransferSession::source(
            file.clone(),
            self.local_id,
            destination,
            resume_offset,
            chunk_size,
            self.config.retry_limit,
        );
        let shared = self.sessions.insert(session)?;
        shared.lock().activate();
        Ok(shared)
    }

    /// Called when a connection driving `shared` ends. Terminal sessions leave the
    /// table; active ones are paused so the peer can resume.
    pub fn release(&self, shared: &SharedSession) {
        let (id, terminal) = {
            let mut s = shared.lock();
            if s.status() == SessionStatus::Active {
                s.pause();
            }
            (s.id(), s.status().is_terminal())
        };
        if terminal {
            self.sessions.remove(&id);
        }
    }
}
