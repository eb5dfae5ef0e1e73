//! Error taxonomy shared by registry, negotiation and sessions.

use crate::identity::PeerId;
use crate::protocol::RejectReason;
use crate::session::SessionStatus;
use crate::store::StoreError;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum P2pError {
    #[error("peer {0} is already registered")]
    DuplicatePeer(PeerId),
    #[error("no source available for {0}")]
    NoSourceAvailable(String),
    #[error("chunk mismatch: expected offset {expected}, got {actual}")]
    ChunkMismatch { expected: u64, actual: u64 },
    #[error("fingerprint mismatch for {0}")]
    CorruptTransfer(String),
    #[error("a transfer of {0} is already active for this destination")]
    SessionAlreadyActive(String),
    #[error("transfer cancelled")]
    Cancelled,
    #[error("session is {0:?}")]
    Inactive(SessionStatus),
    #[error("cannot resume at {offset}: limit is {limit}")]
    InvalidResume { offset: u64, limit: u64 },
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl P2pError {
    /// Wire reason sent to a peer when a request fails with this error.
    pub fn reject_reason(&self) -> RejectReason {
        match self {
            P2pError::DuplicatePeer(_) => RejectReason::DuplicatePeer,
            P2pError::NoSourceAvailable(_) | P2pError::Store(_) => RejectReason::NotFound,
            P2pError::SessionAlreadyActive(_) => RejectReason::SessionAlreadyActive,
            P2pError::InvalidResume { .. } => RejectReason::InvalidResume,
            P2pError::Cancelled => RejectReason::ShuttingDown,
            P2pError::ChunkMismatch { .. }
            | P2pError::CorruptTransfer(_)
            | P2pError::Inactive(_) => RejectReason::BadRequest,
        }
    }
}

pub type Result<T, E = P2pError> = std::result::Result<T, E>;
