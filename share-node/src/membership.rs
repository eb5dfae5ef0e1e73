//! Tracker membership: register with a tracker node, advertise the local catalog,
//! and keep the registration alive with heartbeats. Reconnects with backoff.

use std::net::SocketAddr;
use std::sync::Arc;

use share_core::{FileRef, Message, RejectReason, ShareCore, PROTOCOL_VERSION};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::transport::{self, TransportError};

/// Handle to a running membership task.
pub struct Membership {
    /// Files published after joining, offered on the control connection.
    offers: mpsc::UnboundedSender<FileRef>,
    shutdown: CancellationToken,
    task: JoinHandle<()>,
}

impl Membership {
    /// Start joining `tracker`, advertising `listen_port` as this node's transfer port.
    pub fn join(core: Arc<ShareCore>, tracker: SocketAddr, listen_port: u16) -> Self {
        let (offers, rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(membership_loop(
            core,
            tracker,
            listen_port,
            rx,
            shutdown.clone(),
        ));
        Self {
            offers,
            shutdown,
            task,
        }
    }

    /// Advertise a newly published file.
    pub fn offer(&self, file: FileRef) {
        let _ = self.offers.send(file);
    }

    /// Say goodbye to the tracker and stop.
    pub async fn leave(self) {
        self.shutdown.cancel();
        let _ = self.task.await;
    }
}

#[derive(Debug, thiserror::Error)]
enum JoinError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("tracker refused: {0:?}")]
    Refused(RejectReason),
}

async fn membership_loop(
    core: Arc<ShareCore>,
    tracker: SocketAddr,
    listen_port: u16,
    mut offers: mpsc::UnboundedReceiver<FileRef>,
    shutdown: CancellationToken,
) {
    let mut attempt = 0u32;
    loop {
        let session = tokio::select! {
            _ = shutdown.cancelled() => return,
            joined = connect(&core, tracker, listen_port) => joined,
        };
        match session {
            Ok(mut stream) => {
                attempt = 0;
                info!(%tracker, "joined tracker");
                match run_control(&core, &mut stream, &mut offers, &shutdown).await {
                    Ok(()) => return,
                    Err(e) => warn!(%tracker, error = %e, "tracker connection lost"),
                }
            }
            // A stale registration from our previous connection has not expired yet.
            Err(JoinError::Refused(RejectReason::DuplicatePeer)) => {
                debug!(%tracker, "tracker still holds previous registration");
            }
            Err(e) => warn!(%tracker, error = %e, "join failed"),
        }
        attempt = attempt.saturating_add(1);
        let delay = core.config().backoff(attempt);
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

async fn connect(
    core: &ShareCore,
    tracker: SocketAddr,
    listen_port: u16,
) -> Result<TcpStream, JoinError> {
    let limit = core.config().handshake_timeout();
    let mut stream = tokio::time::timeout(limit, TcpStream::connect(tracker))
        .await
        .map_err(|_| TransportError::Timeout(limit))?
        .map_err(TransportError::from)?;
    stream.set_nodelay(true).map_err(TransportError::from)?;
    let hello = Message::Hello {
        protocol_version: PROTOCOL_VERSION,
        peer_id: core.local_id(),
        listen_port,
    };
    transport::write_message_timeout(&mut stream, &hello, limit).await?;
    match transport::read_message_timeout(&mut stream, limit).await? {
        Message::Welcome { peer_id } => {
            debug!(tracker = %peer_id, "welcome");
            Ok(stream)
        }
        Message::Reject { reason } => Err(JoinError::Refused(reason)),
        other => Err(TransportError::Unexpected(other.kind()).into()),
    }
}

/// Offer the whole catalog, then forward new offers and heartbeats until shutdown.
async fn run_control(
    core: &ShareCore,
    stream: &mut TcpStream,
    offers: &mut mpsc::UnboundedReceiver<FileRef>,
    shutdown: &CancellationToken,
) -> Result<(), TransportError> {
    let limit = core.config().handshake_timeout();
    for file in core.store().catalog() {
        transport::write_message_timeout(stream, &Message::Offer { file }, limit).await?;
    }
    let mut heartbeat = tokio::time::interval(core.config().heartbeat_interval());
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;
    loop {
        let msg = tokio::select! {
            _ = shutdown.cancelled() => {
                let _ = transport::write_message_timeout(stream, &Message::Goodbye, limit).await;
                return Ok(());
            }
            _ = heartbeat.tick() => Message::Heartbeat,
            offer = offers.recv() => match offer {
                Some(file) => Message::Offer { file },
                // Handle dropped without `leave`.
                None => {
                    let _ = transport::write_message_timeout(stream, &Message::Goodbye, limit).await;
                    return Ok(());
                }
            },
        };
        transport::write_message_timeout(stream, &msg, limit).await?;
    }
}
