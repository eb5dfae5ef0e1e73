//! Destination side: negotiate with dial fall-through, pull chunks, verify, publish.

use std::net::SocketAddr;
use std::time::Duration;

use rand::Rng;
use share_core::chunk::Chunk;
use share_core::session::{Delivery, Pull};
use share_core::{
    Candidates, Config, FailureReason, FileRef, Message, P2pError, PeerInfo, RejectReason, Role,
    SessionId, ShareCore, SharedSession, SourceDirectory, StoreError, PROTOCOL_VERSION,
};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::transport::{self, TransportError};

/// Re-sent chunks tolerated in a row before the source is treated as misbehaving.
const MAX_DUPLICATES: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    P2p(#[from] P2pError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("rejected by source: {0:?}")]
    Rejected(RejectReason),
    #[error("storage task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
    #[error("every candidate source for {0} refused or was unreachable")]
    NoSourceAccepted(String),
    #[error("gave up on {0} after repeated failures")]
    RetriesExhausted(String),
}

impl From<StoreError> for FetchError {
    fn from(e: StoreError) -> Self {
        FetchError::P2p(P2pError::Store(e))
    }
}

impl FetchError {
    /// Whether the transfer may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            FetchError::Transport(e) => e.is_transient(),
            FetchError::Rejected(reason) => matches!(
                reason,
                RejectReason::SessionAlreadyActive | RejectReason::ShuttingDown
            ),
            FetchError::NoSourceAccepted(_) => true,
            _ => false,
        }
    }
}

/// Exponential backoff with up to 50% random jitter.
fn retry_delay(config: &Config, attempt: u32) -> Duration {
    let base = config.backoff(attempt);
    let spread = base.as_millis() as u64 / 2;
    let jitter = rand::thread_rng().gen_range(0..=spread);
    base + Duration::from_millis(jitter)
}

/// Fetch `file` from the sources `directory` names, starting at `resume_offset`.
///
/// Transient failures pause the session and retry after a backoff, resuming at the
/// acknowledged offset. On success the file is published in the local store.
pub async fn fetch(
    core: &ShareCore,
    directory: &(dyn SourceDirectory + Sync),
    file: &FileRef,
    resume_offset: u64,
) -> Result<(), FetchError> {
    let retry_limit = core.config().retry_limit;
    let mut offset = resume_offset;
    let mut failed_dials = 0u32;
    loop {
        let (shared, mut stream) = match negotiate(core, directory, file, offset).await {
            Ok(pair) => pair,
            Err(FetchError::NoSourceAccepted(id)) if failed_dials < retry_limit => {
                failed_dials += 1;
                let delay = retry_delay(core.config(), failed_dials);
                warn!(file = %id, attempt = failed_dials, ?delay, "no source accepted, retrying");
                tokio::time::sleep(delay).await;
                continue;
            }
            Err(FetchError::NoSourceAccepted(id)) => {
                give_up(core, &id);
                return Err(FetchError::RetriesExhausted(id));
            }
            Err(e) => return Err(e),
        };
        failed_dials = 0;

        let result = drive(core, &shared, &mut stream).await;
        drop(stream);
        let id = shared.lock().id();
        match result {
            Ok(()) => {
                core.sessions().remove(&id);
                info!(file = %file.id, "download complete");
                return Ok(());
            }
            Err(e) if e.is_transient() => {
                let (resumable, attempts, acked) = {
                    let mut s = shared.lock();
                    let resumable = s.pause();
                    (resumable, s.attempts(), s.acked())
                };
                if !resumable {
                    core.sessions().remove(&id);
                    warn!(file = %file.id, error = %e, "giving up");
                    return Err(FetchError::RetriesExhausted(file.id.clone()));
                }
                let delay = retry_delay(core.config(), attempts);
                warn!(file = %file.id, error = %e, attempt = attempts, acked, ?delay, "transfer interrupted, retrying");
                tokio::time::sleep(delay).await;
                offset = acked;
            }
            Err(e) => {
                shared.lock().cancel();
                core.sessions().remove(&id);
                warn!(file = %file.id, error = %e, "download failed");
                return Err(e);
            }
        }
    }
}

/// Fail and drop a resumed session left paused by the last negotiation.
fn give_up(core: &ShareCore, file_id: &str) {
    let Some(shared) = core.sessions().find(Role::Destination, core.local_id(), file_id) else {
        return;
    };
    let id = {
        let mut s = shared.lock();
        s.fail(FailureReason::RetriesExhausted);
        s.id()
    };
    core.sessions().remove(&id);
}

/// Try each candidate in order; the first that accepts the handshake wins.
async fn negotiate(
    core: &ShareCore,
    directory: &(dyn SourceDirectory + Sync),
    file: &FileRef,
    offset: u64,
) -> Result<(SharedSession, TcpStream), FetchError> {
    let negotiator = core.negotiator();
    let mut negotiation = negotiator.begin(directory, core.local_id(), file, offset)?;
    let candidates = negotiation.candidates().to_vec();
    let offset = negotiation.offset();
    if negotiation.is_resume() {
        debug!(file = %file.id, offset, "resuming paused session");
    }
    for candidate in &candidates {
        let shared = negotiator.conclude(&mut negotiation, candidate)?;
        let chunk_size = shared.lock().chunk_size();
        match dial(core, candidate, file, offset, chunk_size).await {
            Ok(Accepted {
                stream,
                remote,
                chunk_size,
            }) => {
                {
                    let mut s = shared.lock();
                    s.adopt_chunk_size(chunk_size);
                    s.activate();
                }
                debug!(peer = %candidate.peer_id, file = %file.id, offset, chunk_size, %remote, "source accepted");
                return Ok((shared, stream));
            }
            Err(e) => {
                warn!(peer = %candidate.peer_id, addr = %candidate.addr, error = %e, "candidate failed");
            }
        }
    }
    let abandoned = negotiator.abandon(negotiation);
    debug!(file = %file.id, error = %abandoned, "negotiation abandoned");
    Err(FetchError::NoSourceAccepted(file.id.clone()))
}

/// A source that accepted the handshake, with its session id and chunk size.
struct Accepted {
    stream: TcpStream,
    remote: SessionId,
    chunk_size: u64,
}

async fn dial(
    core: &ShareCore,
    candidate: &PeerInfo,
    file: &FileRef,
    offset: u64,
    chunk_size: u64,
) -> Result<Accepted, FetchError> {
    let limit = core.config().handshake_timeout();
    let mut stream = tokio::time::timeout(limit, TcpStream::connect(candidate.addr))
        .await
        .map_err(|_| TransportError::Timeout(limit))?
        .map_err(TransportError::from)?;
    stream.set_nodelay(true).map_err(TransportError::from)?;
    let handshake = Message::Handshake {
        protocol_version: PROTOCOL_VERSION,
        peer_id: core.local_id(),
        file: file.clone(),
        resume_offset: offset,
        chunk_size,
    };
    transport::write_message_timeout(&mut stream, &handshake, limit).await?;
    match transport::read_message_timeout(&mut stream, limit).await? {
        Message::Accept {
            session_id,
            offset: at,
            chunk_size,
        } if at == offset => Ok(Accepted {
            stream,
            remote: SessionId::from_bytes(session_id),
            chunk_size,
        }),
        Message::Accept { .. } => Err(FetchError::Rejected(RejectReason::BadRequest)),
        Message::Reject { reason } => Err(FetchError::Rejected(reason)),
        other => Err(TransportError::Unexpected(other.kind()).into()),
    }
}

async fn send_cancel(stream: &mut TcpStream) {
    let _ = transport::write_message(stream, &Message::Cancel).await;
}

/// Pull chunks until the resume point reaches the end, then verify and publish.
async fn drive(
    core: &ShareCore,
    shared: &SharedSession,
    stream: &mut TcpStream,
) -> Result<(), FetchError> {
    let (file, token) = {
        let s = shared.lock();
        (s.file().clone(), s.cancel_token())
    };
    let idle = core.config().idle_timeout();
    let mut requested = false;
    let mut duplicates = 0u32;
    loop {
        let pull = shared.lock().pull();
        let range = match pull {
            Ok(Pull::Range(range)) => range,
            Ok(Pull::EndOfFile) => break,
            Err(e) => {
                send_cancel(stream).await;
                return Err(e.into());
            }
        };
        requested = true;
        let request = Message::ChunkRequest {
            offset: range.offset,
            length: range.length,
        };
        transport::write_message_timeout(stream, &request, idle).await?;
        let msg = tokio::select! {
            _ = token.cancelled() => {
                send_cancel(stream).await;
                return Err(P2pError::Cancelled.into());
            }
            msg = transport::read_message_timeout(stream, idle) => msg?,
        };
        let chunk = match msg {
            Message::ChunkData { offset, payload } => Chunk::new(offset, payload),
            Message::EndOfFile { size } => {
                send_cancel(stream).await;
                shared.lock().fail(FailureReason::ChunkMismatch);
                return Err(P2pError::ChunkMismatch {
                    expected: range.end(),
                    actual: size,
                }
                .into());
            }
            Message::Cancel => {
                shared.lock().cancel();
                return Err(P2pError::Cancelled.into());
            }
            other => return Err(TransportError::Unexpected(other.kind()).into()),
        };

        let delivery = shared.lock().receive(&chunk);
        match delivery {
            Ok(Delivery::Duplicate) if duplicates < MAX_DUPLICATES => {
                duplicates += 1;
                continue;
            }
            Ok(Delivery::Duplicate) => {
                send_cancel(stream).await;
                shared.lock().fail(FailureReason::ChunkMismatch);
                return Err(P2pError::ChunkMismatch {
                    expected: range.offset,
                    actual: chunk.offset,
                }
                .into());
            }
            Ok(Delivery::Fresh) => duplicates = 0,
            Err(e) => {
                send_cancel(stream).await;
                return Err(e.into());
            }
        }
        let end = chunk.end();
        let store = core.store().clone();
        let target = file.clone();
        tokio::task::spawn_blocking(move || store.write_range(&target, chunk.offset, &chunk.payload))
            .await??;
        shared.lock().ack(end)?;
        transport::write_message_timeout(stream, &Message::Ack { offset: end }, idle).await?;
    }

    // Resumed at the end: let the source close its session.
    if !requested {
        let _ = transport::write_message_timeout(stream, &Message::Ack { offset: file.size }, idle).await;
    }

    let finished = shared.lock().finish();
    let store = core.store().clone();
    match finished {
        Ok(()) => {
            let target = file.clone();
            tokio::task::spawn_blocking(move || store.publish(&target)).await??;
            Ok(())
        }
        Err(e @ P2pError::CorruptTransfer(_)) => {
            warn!(file = %file.id, "fingerprint mismatch, discarding partial content");
            let target = file.clone();
            tokio::task::spawn_blocking(move || store.discard_partial(&target)).await??;
            Err(e.into())
        }
        Err(e) => Err(e.into()),
    }
}

/// Ask a tracker which peers serve `file_id`.
pub async fn lookup(
    tracker: SocketAddr,
    file_id: &str,
    limit: Duration,
) -> Result<(Option<FileRef>, Candidates), FetchError> {
    let mut stream = tokio::time::timeout(limit, TcpStream::connect(tracker))
        .await
        .map_err(|_| TransportError::Timeout(limit))?
        .map_err(TransportError::from)?;
    let request = Message::Lookup {
        file_id: file_id.to_string(),
    };
    transport::write_message_timeout(&mut stream, &request, limit).await?;
    match transport::read_message_timeout(&mut stream, limit).await? {
        Message::Servers { file, peers } => {
            let peers = peers.into_iter().map(|p| PeerInfo {
                peer_id: p.peer_id,
                addr: p.addr,
            });
            let mut candidates = Candidates::default();
            candidates.extend_unique(peers);
            Ok((file, candidates))
        }
        Message::Reject { reason } => Err(FetchError::Rejected(reason)),
        other => Err(TransportError::Unexpected(other.kind()).into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_delay_stays_within_jitter_bounds() {
        let config = Config::default();
        for attempt in 1..8 {
            let base = config.backoff(attempt);
            let delay = retry_delay(&config, attempt);
            assert!(delay >= base);
            assert!(delay <= base + base / 2);
        }
    }

    #[test]
    fn transient_classification() {
        assert!(FetchError::Transport(TransportError::Closed).is_transient());
        assert!(FetchError::Rejected(RejectReason::SessionAlreadyActive).is_transient());
        assert!(!FetchError::Rejected(RejectReason::NotFound).is_transient());
        assert!(FetchError::NoSourceAccepted("f1".into()).is_transient());
        assert!(!FetchError::P2p(P2pError::NoSourceAvailable("f1".into())).is_transient());
        assert!(!FetchError::P2p(P2pError::CorruptTransfer("f1".into())).is_transient());
    }
}
