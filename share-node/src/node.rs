//! A running node: server, optional tracker membership, and tracker-aware fetch.

use std::net::SocketAddr;
use std::sync::Arc;

use share_core::{Candidates, FileRef, P2pError, ShareCore};
use tracing::{info, warn};

use crate::client::{self, FetchError};
use crate::membership::Membership;
use crate::server::{P2pServer, ServerError};

pub struct Node {
    core: Arc<ShareCore>,
    tracker: Option<SocketAddr>,
    server: Option<P2pServer>,
    membership: Option<Membership>,
}

impl Node {
    pub fn new(core: Arc<ShareCore>, tracker: Option<SocketAddr>) -> Self {
        Self {
            core,
            tracker,
            server: None,
            membership: None,
        }
    }

    pub fn core(&self) -> &Arc<ShareCore> {
        &self.core
    }

    /// Address the server is bound to, once serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server.as_ref().map(P2pServer::local_addr)
    }

    /// Start the server and, if a tracker is configured, join it.
    pub async fn serve(&mut self, listen: SocketAddr) -> Result<SocketAddr, ServerError> {
        let server = P2pServer::start(self.core.clone(), listen).await?;
        let local = server.local_addr();
        if let Some(tracker) = self.tracker {
            self.membership = Some(Membership::join(self.core.clone(), tracker, local.port()));
        }
        self.server = Some(server);
        Ok(local)
    }

    /// Fetch a file by identifier from peers known locally and to the tracker,
    /// resuming from any partial content already held. Returns the published FileRef.
    pub async fn fetch(&self, file_id: &str) -> Result<FileRef, FetchError> {
        let mut file = self.core.registry().resolve(file_id);
        let mut remote = Candidates::default();
        if let Some(tracker) = self.tracker {
            let limit = self.core.config().handshake_timeout();
            match client::lookup(tracker, file_id, limit).await {
                Ok((found, peers)) => {
                    if file.is_none() {
                        file = found;
                    }
                    remote = peers;
                }
                Err(e) => warn!(%tracker, file = %file_id, error = %e, "tracker lookup failed"),
            }
        }
        let file = file.ok_or_else(|| P2pError::NoSourceAvailable(file_id.to_string()))?;
        if self.core.holds(&file) {
            return Ok(file);
        }

        let mut candidates = Candidates::default();
        candidates.extend_unique(self.core.registry().find_servers(&file));
        candidates.extend_unique(remote.0);
        let resume = self.core.store().partial_len(&file);
        if resume > 0 {
            info!(file = %file.id, offset = resume, "resuming partial download");
        }
        client::fetch(&self.core, &candidates, &file, resume).await?;
        if let Some(membership) = &self.membership {
            membership.offer(file.clone());
        }
        Ok(file)
    }

    /// Leave the tracker and stop the server.
    pub async fn shutdown(mut self) {
        if let Some(membership) = self.membership.take() {
            membership.leave().await;
        }
        if let Some(server) = self.server.take() {
            server.stop().await;
        }
    }
}
