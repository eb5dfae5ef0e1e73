//! Peer-to-peer distribution core for a self-hosted file-sharing server.
//! Host-driven: no sockets, no timers; the host feeds requests and drives sessions.

pub mod chunk;
pub mod config;
pub mod core;
pub mod error;
pub mod identity;
pub mod integrity;
pub mod negotiator;
pub mod protocol;
pub mod registry;
pub mod session;
pub mod store;
pub mod wire;

pub use crate::core::{ShareCore, SweepReport};
pub use config::Config;
pub use error::{P2pError, Result};
pub use identity::{FileRef, Fingerprint, PeerId};
pub use negotiator::{Negotiation, Negotiator};
pub use protocol::{Message, PeerAddr, RejectReason, PROTOCOL_VERSION};
pub use registry::{Candidates, PeerInfo, PeerRegistry, SourceDirectory};
pub use session::{
    FailureReason, Role, SessionId, SessionStatus, SessionTable, SharedSession, TransferSession,
};
pub use store::{ChunkStore, MemoryStore, StoreError};
pub use wire::{encode_frame, FrameDecodeError, FrameEncodeError};
