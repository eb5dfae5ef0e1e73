//! Peer wire protocol: message types and version.

use std::net::SocketAddr;

use serde::{Deserialize, Serialize};

use crate::identity::{FileRef, PeerId};

/// Current protocol version. Sent in `Hello` and `Handshake`.
pub const PROTOCOL_VERSION: u8 = 1;

/// Candidate source returned by a lookup, in the responder's recency order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddr {
    pub peer_id: PeerId,
    pub addr: SocketAddr,
}

/// Why a node refused a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RejectReason {
    /// The requested FileRef is not held here (or not with that fingerprint).
    NotFound,
    DuplicatePeer,
    SessionAlreadyActive,
    InvalidResume,
    VersionMismatch,
    ShuttingDown,
    BadRequest,
}

/// All wire message types. Encoding is bincode; framing is length-prefix (see wire module).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    /// Membership: open a control connection and register with the receiving node.
    Hello {
        protocol_version: u8,
        peer_id: PeerId,
        listen_port: u16,
    },
    /// Membership accepted; carries the receiving node's own ID.
    Welcome {
        peer_id: PeerId,
    },
    /// Sender can serve this file.
    Offer {
        file: FileRef,
    },
    /// Sender no longer serves this file.
    Withdraw {
        file_id: String,
    },
    /// Liveness refresh on a control connection.
    Heartbeat,
    /// Graceful leave; the receiver unregisters the sender.
    Goodbye,
    /// Ask which peers can serve a file. First message of a short-lived connection.
    Lookup {
        file_id: String,
    },
    /// Answer to `Lookup`.
    Servers {
        file: Option<FileRef>,
        peers: Vec<PeerAddr>,
    },
    /// Transfer request: destination asks the receiver to act as source.
    Handshake {
        protocol_version: u8,
        peer_id: PeerId,
        file: FileRef,
        resume_offset: u64,
        chunk_size: u64,
    },
    /// Source acknowledged the handshake; the session is active from `offset`.
    Accept {
        session_id: [u8; 16],
        offset: u64,
        chunk_size: u64,
    },
    /// Request refused.
    Reject {
        reason: RejectReason,
    },
    /// Destination pulls the next chunk.
    ChunkRequest {
        offset: u64,
        length: u64,
    },
    /// Chunk payload starting at `offset`.
    ChunkData {
        offset: u64,
        payload: Vec<u8>,
    },
    /// Requested offset is the end of the file.
    EndOfFile {
        size: u64,
    },
    /// Destination durably stored everything below `offset`.
    Ack {
        offset: u64,
    },
    /// Either side aborts the session.
    Cancel,
}

impl Message {
    /// Short name for logging.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Hello { .. } => "hello",
            Message::Welcome { .. } => "welcome",
            Message::Offer { .. } => "offer",
            Message::Withdraw { .. } => "withdraw",
            Message::Heartbeat => "heartbeat",
            Message::Goodbye => "goodbye",
            Message::Lookup { .. } => "lookup",
            Message::Servers { .. } => "servers",
            Message::Handshake { .. } => "handshake",
            Message::Accept { .. } => "accept",
            Message::Reject { .. } => "reject",
            Message::ChunkRequest { .. } => "chunk-request",
            Message::ChunkData { .. } => "chunk-data",
            Message::EndOfFile { .. } => "end-of-file",
            Message::Ack { .. } => "ack",
            Message::Cancel => "cancel",
        }
    }
}
