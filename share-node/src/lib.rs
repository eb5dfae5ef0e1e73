//! P2P distribution daemon: transfer server, tracker membership, filesystem store.

use std::net::SocketAddr;
use std::sync::Arc;

use share_core::ShareCore;

pub mod client;
pub mod config;
pub mod fs_store;
pub mod membership;
pub mod node;
pub mod server;
pub mod transport;

pub use client::{fetch, lookup, FetchError};
pub use config::NodeConfig;
pub use fs_store::FsStore;
pub use membership::Membership;
pub use node::Node;
pub use server::{P2pServer, ServerError};
pub use transport::TransportError;

/// Start serving transfers on `listen` in the background.
pub async fn start_p2p_server(
    core: Arc<ShareCore>,
    listen: SocketAddr,
) -> Result<P2pServer, ServerError> {
    P2pServer::start(core, listen).await
}

/// Start the server only when `enable_p2p` is set.
pub async fn start_if_enabled(
    config: &NodeConfig,
    core: Arc<ShareCore>,
) -> Result<Option<P2pServer>, ServerError> {
    if !config.enable_p2p {
        tracing::info!("p2p disabled");
        return Ok(None);
    }
    start_p2p_server(core, config.listen).await.map(Some)
}
