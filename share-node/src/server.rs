//! P2P server: accept loop, per-connection dispatch, liveness sweep, start/stop.
//!
//! The first frame of a connection decides what it is:
//! - `Hello` opens a control connection (membership: offers and heartbeats).
//! - `Lookup` asks which peers serve a file and is answered once.
//! - `Handshake` asks this node to act as source for a transfer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use share_core::chunk::ChunkRange;
use share_core::session::Pull;
use share_core::{
    FileRef, Message, PeerAddr, PeerId, RejectReason, SessionStatus, ShareCore,
    SharedSession, PROTOCOL_VERSION,
};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::transport::{self, TransportError};

const ACCEPT_BACKOFF_MIN: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// A running server. Dropping it without `stop` leaves the tasks running.
pub struct P2pServer {
    core: Arc<ShareCore>,
    local_addr: SocketAddr,
    shutdown: CancellationToken,
    accept_task: JoinHandle<()>,
    sweep_task: JoinHandle<()>,
}

impl P2pServer {
    /// Bind `listen` and start accepting. Bind failure is the only fatal error.
    pub async fn start(core: Arc<ShareCore>, listen: SocketAddr) -> Result<Self, ServerError> {
        let bind_err = |source| ServerError::Bind {
            addr: listen,
            source,
        };
        let listener = TcpListener::bind(listen).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        info!(addr = %local_addr, peer = %core.local_id(), "p2p server listening");

        let shutdown = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(listener, core.clone(), shutdown.clone()));
        let sweep_task = tokio::spawn(sweep_loop(core.clone(), shutdown.clone()));
        Ok(Self {
            core,
            local_addr,
            shutdown,
            accept_task,
            sweep_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn core(&self) -> &Arc<ShareCore> {
        &self.core
    }

    /// Stop accepting, cancel every session, and wait for connections to wind down.
    /// Connections still open after the grace period are aborted.
    pub async fn stop(self) {
        self.shutdown.cancel();
        let cancelled = self.core.sessions().cancel_all();
        info!(addr = %self.local_addr, cancelled, "p2p server stopping");
        if let Err(e) = self.accept_task.await {
            error!(error = %e, "accept task failed");
        }
        if let Err(e) = self.sweep_task.await {
            error!(error = %e, "sweep task failed");
        }
        info!(addr = %self.local_addr, "p2p server stopped");
    }
}

async fn accept_loop(listener: TcpListener, core: Arc<ShareCore>, shutdown: CancellationToken) {
    let mut connections = JoinSet::new();
    let mut backoff = ACCEPT_BACKOFF_MIN;
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote)) => {
                    backoff = ACCEPT_BACKOFF_MIN;
                    let core = core.clone();
                    let shutdown = shutdown.clone();
                    connections.spawn(async move {
                        if let Err(e) = handle_connection(core, stream, remote, shutdown).await {
                            debug!(%remote, error = %e, "connection closed with error");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, ?backoff, "accept failed");
                    if !backoff_or_stop(backoff, &shutdown).await {
                        break;
                    }
                    backoff = (backoff * 2).min(ACCEPT_BACKOFF_MAX);
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(e) = joined {
                    if e.is_panic() {
                        error!(error = %e, "connection task panicked");
                    }
                }
            }
        }
    }
    drop(listener);

    let grace = core.config().stop_grace();
    let drained = tokio::time::timeout(grace, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!(remaining = connections.len(), "forcing connections closed");
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }
}

/// Sleep for `backoff` unless the server is stopping. False once stopping.
async fn backoff_or_stop(backoff: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(backoff) => true,
    }
}

async fn sweep_loop(core: Arc<ShareCore>, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(core.config().sweep_interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = ticker.tick() => {
                let report = core.sweep(Instant::now());
                if !report.evicted.is_empty() || report.sessions != Default::default() {
                    debug!(
                        evicted = report.evicted.len(),
                        paused = report.sessions.paused,
                        failed = report.sessions.failed,
                        removed = report.sessions.removed,
                        "sweep"
                    );
                }
            }
        }
    }
}

async fn handle_connection(
    core: Arc<ShareCore>,
    mut stream: TcpStream,
    remote: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    stream.set_nodelay(true)?;
    let limit = core.config().handshake_timeout();
    let first = tokio::select! {
        _ = shutdown.cancelled() => return Ok(()),
        msg = transport::read_message_timeout(&mut stream, limit) => msg?,
    };
    if shutdown.is_cancelled() {
        return reject(&mut stream, RejectReason::ShuttingDown, limit).await;
    }
    match first {
        Message::Hello {
            protocol_version,
            peer_id,
            listen_port,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                return reject(&mut stream, RejectReason::VersionMismatch, limit).await;
            }
            let addr = SocketAddr::new(remote.ip(), listen_port);
            serve_control(&core, stream, peer_id, addr, shutdown).await
        }
        Message::Lookup { file_id } => {
            let advertised = stream.local_addr()?;
            let answer = lookup_answer(&core, &file_id, advertised);
            transport::write_message_timeout(&mut stream, &answer, limit).await
        }
        Message::Handshake {
            protocol_version,
            peer_id,
            file,
            resume_offset,
            chunk_size,
        } => {
            if protocol_version != PROTOCOL_VERSION {
                return reject(&mut stream, RejectReason::VersionMismatch, limit).await;
            }
            serve_transfer(&core, stream, peer_id, file, resume_offset, chunk_size).await
        }
        other => {
            warn!(%remote, kind = other.kind(), "unexpected first message");
            reject(&mut stream, RejectReason::BadRequest, limit).await
        }
    }
}

async fn reject(
    stream: &mut TcpStream,
    reason: RejectReason,
    limit: Duration,
) -> Result<(), TransportError> {
    transport::write_message_timeout(stream, &Message::Reject { reason }, limit).await
}

/// Servers for a file: peers that offered it, plus this node when it holds it.
fn lookup_answer(core: &ShareCore, file_id: &str, advertised: SocketAddr) -> Message {
    let Some(file) = core.resolve(file_id) else {
        return Message::Servers {
            file: None,
            peers: Vec::new(),
        };
    };
    let mut peers: Vec<PeerAddr> = core
        .registry()
        .find_servers(&file)
        .into_iter()
        .map(|p| PeerAddr {
            peer_id: p.peer_id,
            addr: p.addr,
        })
        .collect();
    if core.holds(&file) {
        peers.push(PeerAddr {
            peer_id: core.local_id(),
            addr: advertised,
        });
    }
    debug!(file = %file.id, servers = peers.len(), "lookup");
    Message::Servers {
        file: Some(file),
        peers,
    }
}

/// Membership connection. Every frame refreshes the peer; loss or silence past the
/// peer timeout unregisters it.
async fn serve_control(
    core: &ShareCore,
    mut stream: TcpStream,
    peer_id: PeerId,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), TransportError> {
    let limit = core.config().handshake_timeout();
    if let Err(e) = core.register_peer(peer_id, addr) {
        warn!(peer = %peer_id, %addr, error = %e, "join refused");
        return reject(&mut stream, e.reject_reason(), limit).await;
    }
    transport::write_message_timeout(
        &mut stream,
        &Message::Welcome {
            peer_id: core.local_id(),
        },
        limit,
    )
    .await?;

    let silence = core.config().peer_timeout();
    let result = loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => break Ok(()),
            msg = transport::read_message_timeout(&mut stream, silence) => msg,
        };
        let msg = match msg {
            Ok(msg) => msg,
            Err(e) => break Err(e),
        };
        core.registry().touch(&peer_id);
        match msg {
            Message::Offer { file } => {
                core.registry().offer(&peer_id, file);
            }
            Message::Withdraw { file_id } => {
                core.registry().withdraw(&peer_id, &file_id);
            }
            Message::Heartbeat => {}
            Message::Goodbye => break Ok(()),
            other => break Err(TransportError::Unexpected(other.kind())),
        }
    };
    core.unregister_peer(&peer_id);
    result
}

/// Source side of one transfer connection.
async fn serve_transfer(
    core: &ShareCore,
    mut stream: TcpStream,
    destination: PeerId,
    file: FileRef,
    resume_offset: u64,
    chunk_size: u64,
) -> Result<(), TransportError> {
    let limit = core.config().handshake_timeout();
    let shared = match core.accept_transfer(destination, &file, resume_offset, chunk_size) {
        Ok(shared) => shared,
        Err(e) => {
            debug!(peer = %destination, file = %file.id, error = %e, "handshake rejected");
            return reject(&mut stream, e.reject_reason(), limit).await;
        }
    };
    let accept = {
        let s = shared.lock();
        Message::Accept {
            session_id: *s.id().as_bytes(),
            offset: s.acked(),
            chunk_size: s.chunk_size(),
        }
    };
    let result = match transport::write_message_timeout(&mut stream, &accept, limit).await {
        Ok(()) => {
            info!(peer = %destination, file = %file.id, offset = resume_offset, "serving");
            serve_chunks(core, &shared, &mut stream).await
        }
        Err(e) => Err(e),
    };
    let status = shared.lock().status();
    match (&result, status) {
        (_, SessionStatus::Completed) => info!(peer = %destination, file = %file.id, "upload complete"),
        (Err(e), _) => debug!(peer = %destination, file = %file.id, error = %e, "upload interrupted"),
        (Ok(()), status) => debug!(peer = %destination, file = %file.id, ?status, "upload ended"),
    }
    core.release(&shared);
    result
}

async fn serve_chunks(
    core: &ShareCore,
    shared: &SharedSession,
    stream: &mut TcpStream,
) -> Result<(), TransportError> {
    let (file, token) = {
        let s = shared.lock();
        (s.file().clone(), s.cancel_token())
    };
    let idle = core.config().idle_timeout();
    loop {
        let msg = tokio::select! {
            _ = token.cancelled() => {
                let _ = transport::write_message_timeout(stream, &Message::Cancel, idle).await;
                return Ok(());
            }
            msg = transport::read_message_timeout(stream, idle) => msg?,
        };
        match msg {
            Message::ChunkRequest { offset, length } => {
                let pull = shared.lock().check_request(ChunkRange { offset, length });
                let reply = match pull {
                    Ok(Pull::Range(range)) => {
                        let store = core.store().clone();
                        let read_file = file.clone();
                        let read = tokio::task::spawn_blocking(move || {
                            store.read_range(&read_file, range.offset, range.length)
                        })
                        .await
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                        match read {
                            Ok(payload) => Message::ChunkData {
                                offset: range.offset,
                                payload,
                            },
                            Err(e) => {
                                warn!(file = %file.id, error = %e, "read failed");
                                shared.lock().cancel();
                                Message::Cancel
                            }
                        }
                    }
                    Ok(Pull::EndOfFile) => Message::EndOfFile { size: file.size },
                    Err(e) => {
                        warn!(file = %file.id, error = %e, "bad chunk request");
                        Message::Cancel
                    }
                };
                let stop = matches!(reply, Message::Cancel);
                transport::write_message_timeout(stream, &reply, idle).await?;
                if stop {
                    return Ok(());
                }
            }
            Message::Ack { offset } => {
                let acked = {
                    let mut s = shared.lock();
                    s.ack(offset).map(|_| s.status())
                };
                match acked {
                    Ok(SessionStatus::Completed) => return Ok(()),
                    Ok(_) => {}
                    Err(e) => {
                        warn!(file = %file.id, error = %e, "bad ack");
                        transport::write_message_timeout(stream, &Message::Cancel, idle).await?;
                        return Ok(());
                    }
                }
            }
            Message::Cancel => {
                debug!(file = %file.id, "destination cancelled");
                shared.lock().cancel();
                return Ok(());
            }
            other => return Err(TransportError::Unexpected(other.kind())),
        }
    }
}
