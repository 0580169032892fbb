//! # Error Taxonomy
//!
//! One `thiserror` enum per component, plus [`ProtocolError`] for callers
//! that don't care which component failed. Recovery policy (§7): heartbeat
//! errors are logged and swallowed, per-peer send failures never affect
//! other peers, and malformed RPCs close the stream without touching the
//! connection.

use thiserror::Error;

use crate::identity::NodeId;

#[derive(Debug, Error)]
pub enum MeshError {
    #[error("topic {0:?} is not subscribed")]
    NotSubscribed(String),
    #[error("peer {0} is not connected")]
    PeerNotConnected(NodeId),
    #[error("peer {0} is backed off from topic {1:?}")]
    PeerBackedOff(NodeId, String),
    #[error("peer {0} is below the graylist threshold")]
    PeerGraylisted(NodeId),
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("router is closed")]
    ServiceClosed,
    #[error("no connection to peer {0}")]
    NoConnection(NodeId),
    #[error("message of {0} bytes exceeds max_message_size")]
    MessageTooLarge(usize),
    #[error("signature verification failed")]
    InvalidSignature,
    #[error("message failed validation: {0}")]
    InvalidMessage(&'static str),
    #[error("read from stream failed: {0}")]
    ReadFailed(String),
    #[error("write to stream failed: {0}")]
    WriteFailed(String),
    #[error("stream failed: {0}")]
    StreamFailed(String),
    #[error("operation timed out")]
    Timeout,
    #[error(transparent)]
    Mesh(#[from] MeshError),
}

#[derive(Debug, Error)]
pub enum ReqRespError {
    #[error("request timed out")]
    Timeout,
    #[error("no connection to peer {0}")]
    NoConnection(NodeId),
    #[error("stream failed: {0}")]
    StreamFailed(String),
    #[error("frame exceeds max length")]
    FrameTooLarge,
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("no connection to peer {0}")]
    NoConnection(NodeId),
    #[error("stream failed: {0}")]
    StreamFailed(String),
    #[error("frame exceeds max length")]
    FrameTooLarge,
}

/// Top-level error aggregating every component's taxonomy, for callers that
/// just want a single `Result` type across the whole public API.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error(transparent)]
    Router(#[from] RouterError),
    #[error(transparent)]
    Mesh(#[from] MeshError),
    #[error(transparent)]
    ReqResp(#[from] ReqRespError),
    #[error(transparent)]
    Notify(#[from] NotifyError),
}
