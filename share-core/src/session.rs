//! Transfer sessions: the per-file state machine on either side of a transfer, and
//! the session table that enforces one live session per (role, destination, file).
//!
//! ```text
//! negotiating -> active -> completed
//!                  |  ^
//!                  v  |
//!                paused ----> failed (retries exhausted / expired)
//! any non-terminal state -> failed (cancelled, chunk mismatch, corrupt transfer)
//! ```
//!
//! Lock order: route map, then session map, then a session's mutex. Code holding a
//! session mutex never touches the maps.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::chunk::{self, Chunk, ChunkRange};
use crate::error::{P2pError, Result};
use crate::identity::{FileRef, PeerId};
use crate::integrity::FingerprintHasher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId([u8; 16]);

impl SessionId {
    pub fn new() -> Self {
        SessionId(uuid::Uuid::new_v4().into_bytes())
    }

    pub fn from_bytes(bytes: [u8; 16]) -> Self {
        SessionId(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..6]))
    }
}

/// Which end of the transfer this node plays in a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Source,
    Destination,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureReason {
    Cancelled,
    ChunkMismatch,
    CorruptTransfer,
    RetriesExhausted,
    /// Paused too long without being resumed.
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Negotiating,
    Active,
    Paused,
    Completed,
    Failed(FailureReason),
}

impl SessionStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Failed(_))
    }
}

/// Result of asking for the next chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pull {
    Range(ChunkRange),
    EndOfFile,
}

/// Result of handing a received chunk to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    /// New data at the expected offset; write it, then `ack(chunk.end())`.
    Fresh,
    /// Already acknowledged; drop it.
    Duplicate,
}

/// Chunk handed out or received but not yet acknowledged.
#[derive(Debug)]
struct Pending {
    end: u64,
    staged: Option<FingerprintHasher>,
}

#[derive(Debug)]
pub struct TransferSession {
    id: SessionId,
    file: FileRef,
    source: PeerId,
    destination: PeerId,
    role: Role,
    acked: u64,
    chunk_size: u64,
    status: SessionStatus,
    attempts: u32,
    retry_limit: u32,
    last_progress: Instant,
    /// Running fingerprint of acknowledged bytes; destination only.
    hasher: Option<FingerprintHasher>,
    pending: Option<Pending>,
    cancel: CancellationToken,
}

impl TransferSession {
    /// Destination-side session. `hasher` must already cover bytes below `start`.
    pub fn destination(
        file: FileRef,
        source: PeerId,
        destination: PeerId,
        start: u64,
        chunk_size: u64,
        retry_limit: u32,
        hasher: FingerprintHasher,
    ) -> Self {
        debug_assert_eq!(hasher.consumed(), start);
        Self::build(
            Role::Destination,
            file,
            source,
            destination,
            start,
            chunk_size,
            retry_limit,
            Some(hasher),
        )
    }

    /// Source-side session serving `destination`.
    pub fn source(
        file: FileRef,
        source: PeerId,
        destination: PeerId,
        start: u64,
        chunk_size: u64,
        retry_limit: u32,
    ) -> Self {
        Self::build(
            Role::Source,
            file,
            source,
            destination,
            start,
            chunk_size,
            retry_limit,
            None,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn build(
        role: Role,
        file: FileRef,
        source: PeerId,
        destination: PeerId,
        start: u64,
        chunk_size: u64,
        retry_limit: u32,
        hasher: Option<FingerprintHasher>,
    ) -> Self {
        Self {
            id: SessionId::new(),
            file,
            source,
            destination,
            role,
            acked: start,
            chunk_size: chunk::clamp_chunk_size(chunk_size),
            status: SessionStatus::Negotiating,
            attempts: 0,
            retry_limit,
            last_progress: Instant::now(),
            hasher,
            pending: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn file(&self) -> &FileRef {
        &self.file
    }

    pub fn source_peer(&self) -> PeerId {
        self.source
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Resume point: every byte below it is acknowledged.
    pub fn acked(&self) -> u64 {
        self.acked
    }

    pub fn chunk_size(&self) -> u64 {
        self.chunk_size
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Signal observed by the task driving this session's connection.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_progress)
    }

    fn touch(&mut self) {
        self.last_progress = Instant::now();
    }

    fn ensure_active(&self) -> Result<()> {
        match self.status {
            SessionStatus::Active => Ok(()),
            SessionStatus::Failed(FailureReason::Cancelled) => Err(P2pError::Cancelled),
            other => Err(P2pError::Inactive(other)),
        }
    }

    fn mismatch(&mut self, expected: u64, actual: u64) -> P2pError {
        self.fail(FailureReason::ChunkMismatch);
        P2pError::ChunkMismatch { expected, actual }
    }

    /// Switch to a different source peer during renegotiation.
    pub fn rebind_source(&mut self, source: PeerId) {
        self.source = source;
    }

    /// Destination: follow the chunk size the source accepted with.
    pub fn adopt_chunk_size(&mut self, chunk_size: u64) {
        self.chunk_size = chunk::clamp_chunk_size(chunk_size);
        self.pending = None;
    }

    /// Source acknowledged: negotiating or paused becomes active. False if terminal.
    pub fn activate(&mut self) -> bool {
        match self.status {
            SessionStatus::Negotiating | SessionStatus::Paused | SessionStatus::Active => {
                self.status = SessionStatus::Active;
                self.touch();
                true
            }
            _ => false,
        }
    }

    /// Transient disconnect or stall. Returns false once the retry budget is spent
    /// (the session is then failed) or if it was already terminal.
    pub fn pause(&mut self) -> bool {
        if self.status.is_terminal() {
            return false;
        }
        self.pending = None;
        self.attempts += 1;
        if self.attempts > self.retry_limit {
            self.fail(FailureReason::RetriesExhausted);
            return false;
        }
        self.status = SessionStatus::Paused;
        true
    }

    /// Cancel from either side. The token fires even if the session already ended.
    pub fn cancel(&mut self) {
        if !self.status.is_terminal() {
            self.status = SessionStatus::Failed(FailureReason::Cancelled);
        }
        self.cancel.cancel();
    }

    pub fn fail(&mut self, reason: FailureReason) {
        if !self.status.is_terminal() {
            self.status = SessionStatus::Failed(reason);
        }
        self.pending = None;
        self.cancel.cancel();
    }

    /// Destination: the next range to request at the resume point.
    pub fn pull(&mut self) -> Result<Pull> {
        self.ensure_active()?;
        Ok(
            match chunk::next_range(self.acked, self.file.size, self.chunk_size) {
                Some(range) => Pull::Range(range),
                None => Pull::EndOfFile,
            },
        )
    }

    /// Destination: validate a chunk returned by the source.
    pub fn receive(&mut self, chunk: &Chunk) -> Result<Delivery> {
        self.ensure_active()?;
        if chunk.offset < self.acked && chunk.end() <= self.acked {
            return Ok(Delivery::Duplicate);
        }
        if chunk.offset != self.acked {
            return Err(self.mismatch(self.acked, chunk.offset));
        }
        let limit = (self.acked + self.chunk_size).min(self.file.size);
        if chunk.is_empty() || chunk.end() > limit {
            return Err(self.mismatch(limit, chunk.end()));
        }
        let staged = self.hasher.as_ref().map(|h| {
            let mut h = h.clone();
            h.update(&chunk.payload);
            h
        });
        self.pending = Some(Pending {
            end: chunk.end(),
            staged,
        });
        self.touch();
        Ok(Delivery::Fresh)
    }

    /// Source: validate a destination's chunk request and clamp it to the layout.
    pub fn check_request(&mut self, range: ChunkRange) -> Result<Pull> {
        self.ensure_active()?;
        if range.offset != self.acked {
            return Err(self.mismatch(self.acked, range.offset));
        }
        let Some(layout) = chunk::next_range(self.acked, self.file.size, self.chunk_size) else {
            return Ok(Pull::EndOfFile);
        };
        let length = if range.length == 0 {
            layout.length
        } else {
            range.length.min(layout.length)
        };
        self.pending = Some(Pending {
            end: range.offset + length,
            staged: None,
        });
        self.touch();
        Ok(Pull::Range(ChunkRange {
            offset: range.offset,
            length,
        }))
    }

    /// Durable receipt of everything below `offset`. Returns whether the resume point
    /// advanced; acknowledging an already-acknowledged offset is a no-op.
    pub fn ack(&mut self, offset: u64) -> Result<bool> {
        if offset <= self.acked {
            // A source that was asked to resume at end of file has nothing left to send.
            if self.role == Role::Source
                && offset == self.file.size
                && self.status == SessionStatus::Active
            {
                self.status = SessionStatus::Completed;
            }
            return Ok(false);
        }
        match self.pending.take() {
            Some(pending) if pending.end == offset => {
                self.acked = offset;
                if let Some(staged) = pending.staged {
                    self.hasher = Some(staged);
                }
                self.attempts = 0;
                self.touch();
                if self.role == Role::Source && self.acked == self.file.size {
                    self.status = SessionStatus::Completed;
                }
                Ok(true)
            }
            Some(pending) => Err(self.mismatch(pending.end, offset)),
            None => Err(self.mismatch(self.acked, offset)),
        }
    }

    /// Source: restart serving from a destination's resume point.
    pub fn rewind(&mut self, offset: u64) -> Result<()> {
        if offset > self.file.size {
            return Err(P2pError::InvalidResume {
                offset,
                limit: self.file.size,
            });
        }
        self.acked = offset;
        self.pending = None;
        Ok(())
    }

    /// Destination: all bytes acknowledged; check the fingerprint and complete.
    pub fn finish(&mut self) -> Result<()> {
        if self.acked != self.file.size {
            return Err(P2pError::ChunkMismatch {
                expected: self.file.size,
                actual: self.acked,
            });
        }
        let matches = match self.hasher.take() {
            Some(hasher) => hasher.finalize() == self.file.fingerprint,
            None => true,
        };
        if matches {
            self.status = SessionStatus::Completed;
            Ok(())
        } else {
            self.fail(FailureReason::CorruptTransfer);
            Err(P2pError::CorruptTransfer(self.file.id.clone()))
        }
    }
}

pub type SharedSession = Arc<Mutex<TransferSession>>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct RouteKey {
    role: Role,
    destination: PeerId,
    file_id: String,
}

impl RouteKey {
    fn of(session: &TransferSession) -> Self {
        Self {
            role: session.role,
            destination: session.destination,
            file_id: session.file.id.clone(),
        }
    }
}

/// Counts from one idle sweep.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionSweep {
    pub paused: usize,
    pub failed: usize,
    pub removed: usize,
}

/// All live sessions of a node.
#[derive(Default)]
pub struct SessionTable {
    sessions: DashMap<SessionId, SharedSession>,
    routes: DashMap<RouteKey, SessionId>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a session. A live session on the same route rejects it with
    /// `SessionAlreadyActive`; a terminal one is replaced.
    pub fn insert(&self, session: TransferSession) -> Result<SharedSession> {
        let id = session.id;
        let key = RouteKey::of(&session);
        let file_id = session.file.id.clone();
        let shared = Arc::new(Mutex::new(session));
        match self.routes.entry(key) {
            Entry::Occupied(mut e) => {
                let existing = self.sessions.get(e.get()).map(|s| s.value().clone());
                if let Some(existing) = existing {
                    if !existing.lock().status().is_terminal() {
                        return Err(P2pError::SessionAlreadyActive(file_id));
                    }
                }
                self.sessions.remove(e.get());
                e.insert(id);
            }
            Entry::Vacant(v) => {
                v.insert(id);
            }
        }
        self.sessions.insert(id, shared.clone());
        Ok(shared)
    }

    pub fn get(&self, id: &SessionId) -> Option<SharedSession> {
        self.sessions.get(id).map(|s| s.value().clone())
    }

    /// The session on a route, if any.
    pub fn find(&self, role: Role, destination: PeerId, file_id: &str) -> Option<SharedSession> {
        let key = RouteKey {
            role,
            destination,
            file_id: file_id.to_string(),
        };
        let id = *self.routes.get(&key)?;
        self.get(&id)
    }

    /// Drop a session from the table. Does not change its status.
    pub fn remove(&self, id: &SessionId) -> Option<SharedSession> {
        let (_, shared) = self.sessions.remove(id)?;
        let key = RouteKey::of(&shared.lock());
        self.routes.remove_if(&key, |_, v| v == id);
        Some(shared)
    }

    /// Cancel and remove a session. Returns false if it was not in the table.
    pub fn cancel(&self, id: &SessionId) -> bool {
        match self.remove(id) {
            Some(shared) => {
                shared.lock().cancel();
                debug!(session = %id, "session cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancel every session in which `peer` is source or destination.
    pub fn cancel_for_peer(&self, peer: &PeerId) -> usize {
        let ids: Vec<SessionId> = self
            .sessions
            .iter()
            .filter(|e| {
                let s = e.value().lock();
                s.source == *peer || s.destination == *peer
            })
            .map(|e| *e.key())
            .collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    /// Cancel everything, e.g. on server stop.
    pub fn cancel_all(&self) -> usize {
        let ids: Vec<SessionId> = self.sessions.iter().map(|e| *e.key()).collect();
        ids.iter().filter(|id| self.cancel(id)).count()
    }

    /// Pause active sessions idle past `idle_timeout`, fail paused sessions idle past
    /// `resume_window`, and drop terminal sessions.
    pub fn sweep(&self, now: Instant, idle_timeout: Duration, resume_window: Duration) -> SessionSweep {
        let mut report = SessionSweep::default();
        let all: Vec<(SessionId, SharedSession)> = self
            .sessions
            .iter()
            .map(|e| (*e.key(), e.value().clone()))
            .collect();
        let mut dead = Vec::new();
        for (id, shared) in all {
            let mut s = shared.lock();
            let idle = s.idle_for(now);
            match s.status() {
                SessionStatus::Active if idle >= idle_timeout => {
                    if s.pause() {
                        report.paused += 1;
                    } else {
                        report.failed += 1;
                    }
                }
                SessionStatus::Paused if idle >= resume_window => {
                    s.fail(FailureReason::Expired);
                    report.failed += 1;
                }
                _ => {}
            }
            if s.status().is_terminal() {
                dead.push(id);
            }
        }
        for id in dead {
            if self.remove(&id).is_some() {
                report.removed += 1;
            }
        }
        report
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::integrity;
    use std::net::SocketAddr;

    fn peer(port: u16) -> PeerId {
        PeerId::generate(&SocketAddr::from(([127, 0, 0, 1], port)))
    }

    fn content(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    fn dest_session(data: &[u8], chunk_size: u64) -> TransferSession {
        let file = FileRef::from_content("f1", data);
        let mut s = TransferSession::destination(
            file,
            peer(1),
            peer(2),
            0,
            chunk_size,
            3,
            FingerprintHasher::new(),
        );
        assert!(s.activate());
        s
    }

    fn deliver(s: &mut TransferSession, data: &[u8], range: ChunkRange) {
        let payload = data[range.offset as usize..range.end() as usize].to_vec();
        let chunk = Chunk::new(range.offset, payload);
        assert_eq!(s.receive(&chunk).unwrap(), Delivery::Fresh);
        assert!(s.ack(chunk.end()).unwrap());
    }

    #[test]
    fn full_pull_loop_completes() {
        let data = content(10_000);
        let mut s = dest_session(&data, 4096);
        while let Pull::Range(range) = s.pull().unwrap() {
            deliver(&mut s, &data, range);
        }
        assert_eq!(s.acked(), 10_000);
        s.finish().unwrap();
        assert_eq!(s.status(), SessionStatus::Completed);
    }

    #[test]
    fn wrong_offset_is_chunk_mismatch() {
        let data = content(10_000);
        let mut s = dest_session(&data, 4096);
        let err = s.receive(&Chunk::new(4096, vec![0; 10])).unwrap_err();
        assert_eq!(
            err,
            P2pError::ChunkMismatch {
                expected: 0,
                actual: 4096
            }
        );
        assert_eq!(
            s.status(),
            SessionStatus::Failed(FailureReason::ChunkMismatch)
        );
        assert!(s.cancel_token().is_cancelled());
    }

    #[test]
    fn oversized_chunk_is_chunk_mismatch() {
        let data = content(10_000);
        let mut s = dest_session(&data, 4096);
        assert!(matches!(
            s.receive(&Chunk::new(0, vec![0; 5000])),
            Err(P2pError::ChunkMismatch { .. })
        ));
    }

    #[test]
    fn adopted_chunk_size_drives_the_layout() {
        let data = content(10_000);
        let mut s = dest_session(&data, 1024 * 1024);
        s.adopt_chunk_size(4096);
        assert_eq!(
            s.pull().unwrap(),
            Pull::Range(ChunkRange {
                offset: 0,
                length: 4096
            })
        );
        assert!(matches!(
            s.receive(&Chunk::new(0, data[..8192].to_vec())),
            Err(P2pError::ChunkMismatch { .. })
        ));
    }

    #[test]
    fn ack_is_idempotent() {
        let data = content(10_000);
        let mut s = dest_session(&data, 4096);
        let Pull::Range(range) = s.pull().unwrap() else {
            panic!("expected range")
        };
        deliver(&mut s, &data, range);
        assert!(!s.ack(range.end()).unwrap());
        assert_eq!(s.acked(), 4096);
        // Re-delivery of the acked chunk is dropped.
        let again = Chunk::new(0, data[..4096].to_vec());
        assert_eq!(s.receive(&again).unwrap(), Delivery::Duplicate);
        assert_eq!(s.acked(), 4096);
        // And the fingerprint still only covers each byte once.
        while let Pull::Range(range) = s.pull().unwrap() {
            deliver(&mut s, &data, range);
        }
        s.finish().unwrap();
    }

    #[test]
    fn ack_without_receipt_is_rejected() {
        let data = content(10_000);
        let mut s = dest_session(&data, 4096);
        assert!(matches!(s.ack(4096), Err(P2pError::ChunkMismatch { .. })));
    }

    #[test]
    fn corrupt_content_fails_finish() {
        let data = content(10_000);
        let mut s = dest_session(&data, 4096);
        let mut tampered = data.clone();
        tampered[5000] ^= 0xff;
        while let Pull::Range(range) = s.pull().unwrap() {
            deliver(&mut s, &tampered, range);
        }
        assert_eq!(s.finish(), Err(P2pError::CorruptTransfer("f1".into())));
        assert_eq!(
            s.status(),
            SessionStatus::Failed(FailureReason::CorruptTransfer)
        );
    }

    #[test]
    fn resume_from_prefix_matches_fingerprint() {
        let data = content(10_000);
        let file = FileRef::from_content("f1", &data);
        let mut prefix = FingerprintHasher::new();
        prefix.update(&data[..4096]);
        let mut s =
            TransferSession::destination(file, peer(1), peer(2), 4096, 4096, 3, prefix);
        s.activate();
        assert_eq!(
            s.pull().unwrap(),
            Pull::Range(ChunkRange {
                offset: 4096,
                length: 4096
            })
        );
        while let Pull::Range(range) = s.pull().unwrap() {
            deliver(&mut s, &data, range);
        }
        s.finish().unwrap();
        assert_eq!(integrity::fingerprint(&data), s.file().fingerprint);
    }

    #[test]
    fn pause_resume_and_retry_budget() {
        let data = content(100);
        let mut s = dest_session(&data, 4096);
        assert!(s.pause());
        assert_eq!(s.status(), SessionStatus::Paused);
        assert!(matches!(s.pull(), Err(P2pError::Inactive(SessionStatus::Paused))));
        assert!(s.activate());
        assert!(s.pause());
        assert!(s.pause());
        assert!(!s.pause());
        assert_eq!(
            s.status(),
            SessionStatus::Failed(FailureReason::RetriesExhausted)
        );
        assert!(!s.activate());
    }

    #[test]
    fn progress_resets_retry_budget() {
        let data = content(10_000);
        let mut s = dest_session(&data, 4096);
        s.pause();
        s.pause();
        s.activate();
        let Pull::Range(range) = s.pull().unwrap() else {
            panic!("expected range")
        };
        deliver(&mut s, &data, range);
        assert_eq!(s.attempts(), 0);
    }

    #[test]
    fn cancel_fails_and_signals() {
        let data = content(100);
        let mut s = dest_session(&data, 4096);
        let token = s.cancel_token();
        s.cancel();
        assert!(token.is_cancelled());
        assert_eq!(s.status(), SessionStatus::Failed(FailureReason::Cancelled));
        assert_eq!(s.pull(), Err(P2pError::Cancelled));
    }

    #[test]
    fn source_serves_requests_in_order() {
        let data = content(10_000);
        let file = FileRef::from_content("f1", &data);
        let mut s = TransferSession::source(file, peer(1), peer(2), 0, 4096, 3);
        s.activate();
        assert_eq!(
            s.check_request(ChunkRange {
                offset: 0,
                length: 1 << 20
            })
            .unwrap(),
            Pull::Range(ChunkRange {
                offset: 0,
                length: 4096
            })
        );
        assert!(s.ack(4096).unwrap());
        assert!(matches!(
            s.check_request(ChunkRange {
                offset: 0,
                length: 4096
            }),
            Err(P2pError::ChunkMismatch { .. })
        ));
    }

    #[test]
    fn source_completes_on_final_ack_and_rewinds() {
        let data = content(5000);
        let file = FileRef::from_content("f1", &data);
        let mut s = TransferSession::source(file, peer(1), peer(2), 0, 4096, 3);
        s.activate();
        s.check_request(ChunkRange {
            offset: 0,
            length: 0,
        })
        .unwrap();
        s.ack(4096).unwrap();
        s.rewind(0).unwrap();
        assert_eq!(s.acked(), 0);
        assert!(s.rewind(6000).is_err());
        s.check_request(ChunkRange {
            offset: 0,
            length: 4096,
        })
        .unwrap();
        s.ack(4096).unwrap();
        s.check_request(ChunkRange {
            offset: 4096,
            length: 4096,
        })
        .unwrap();
        s.ack(5000).unwrap();
        assert_eq!(s.status(), SessionStatus::Completed);
        assert_eq!(
            s.check_request(ChunkRange {
                offset: 5000,
                length: 1
            }),
            Err(P2pError::Inactive(SessionStatus::Completed))
        );
    }

    #[test]
    fn table_rejects_second_live_session_on_route() {
        let table = SessionTable::new();
        let file = FileRef::from_content("f1", b"abc");
        let (src, dst) = (peer(1), peer(2));
        let first = table
            .insert(TransferSession::destination(
                file.clone(),
                src,
                dst,
                0,
                0,
                3,
                FingerprintHasher::new(),
            ))
            .unwrap();
        let second = TransferSession::destination(
            file.clone(),
            peer(3),
            dst,
            0,
            0,
            3,
            FingerprintHasher::new(),
        );
        assert_eq!(
            table.insert(second).unwrap_err(),
            P2pError::SessionAlreadyActive("f1".into())
        );

        // Same file for another destination, or the source role, is a different route.
        table
            .insert(TransferSession::source(file.clone(), dst, src, 0, 0, 3))
            .unwrap();
        assert_eq!(table.len(), 2);

        // Once the first session is terminal, the route can be reused.
        first.lock().fail(FailureReason::Expired);
        table
            .insert(TransferSession::destination(
                file,
                src,
                dst,
                0,
                0,
                3,
                FingerprintHasher::new(),
            ))
            .unwrap();
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn cancel_leaves_no_orphan() {
        let table = SessionTable::new();
        let file = FileRef::from_content("f1", b"abc");
        let shared = table
            .insert(TransferSession::source(file, peer(1), peer(2), 0, 0, 3))
            .unwrap();
        let id = shared.lock().id();
        assert!(table.cancel(&id));
        assert!(table.is_empty());
        assert!(table.find(Role::Source, peer(2), "f1").is_none());
        assert!(!table.cancel(&id));
        assert_eq!(
            shared.lock().status(),
            SessionStatus::Failed(FailureReason::Cancelled)
        );
    }

    #[test]
    fn cancel_for_peer_hits_both_roles() {
        let table = SessionTable::new();
        let (me, a, b) = (peer(1), peer(2), peer(3));
        let f1 = FileRef::from_content("f1", b"abc");
        let f2 = FileRef::from_content("f2", b"def");
        table
            .insert(TransferSession::source(f1.clone(), me, a, 0, 0, 3))
            .unwrap();
        table
            .insert(TransferSession::destination(
                f2,
                a,
                me,
                0,
                0,
                3,
                FingerprintHasher::new(),
            ))
            .unwrap();
        table
            .insert(TransferSession::source(f1, me, b, 0, 0, 3))
            .unwrap();
        assert_eq!(table.cancel_for_peer(&a), 2);
        assert_eq!(table.len(), 1);
        assert!(table.find(Role::Source, b, "f1").is_some());
    }

    #[test]
    fn sweep_pauses_then_expires() {
        let table = SessionTable::new();
        let file = FileRef::from_content("f1", b"abc");
        let shared = table
            .insert(TransferSession::source(file, peer(1), peer(2), 0, 0, 3))
            .unwrap();
        shared.lock().activate();
        let idle = Duration::from_secs(30);
        let window = Duration::from_secs(120);

        let report = table.sweep(Instant::now(), idle, window);
        assert_eq!(report, SessionSweep::default());

        let report = table.sweep(Instant::now() + idle, idle, window);
        assert_eq!(report.paused, 1);
        assert_eq!(shared.lock().status(), SessionStatus::Paused);

        let report = table.sweep(Instant::now() + window, idle, window);
        assert_eq!(report.failed, 1);
        assert_eq!(report.removed, 1);
        assert!(table.is_empty());
    }
}
