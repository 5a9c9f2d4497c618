//! Error types for the protocol crate.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol error type covering all possible failure modes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    // Frame errors
    /// Frame representation is not a well-formed `[flags, streamId, id, payload]` tuple.
    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    /// Serialized frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes exceeds maximum of {max} bytes")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    // Serialization errors
    /// Failed to serialize data.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// Failed to deserialize data.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    // Dispatch errors
    /// Member, context or definition does not exist.
    #[error("not exists: {0}")]
    NotExists(String),

    /// Write attempted on a read-only member.
    #[error("invalid access: {0}")]
    InvalidAccess(String),

    /// Context or definition already exists.
    #[error("already exists: {0}")]
    Exists(String),

    /// Operation is not supported by this peer.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Too many requests are already being served.
    #[error("busy: {0}")]
    Busy(String),

    /// Error reported by the remote peer in an error reply.
    #[error("remote error: {0}")]
    Remote(RemoteError),

    // Connection errors
    /// Connection was closed; carries the close reason.
    #[error("connection closed: {0}")]
    ConnectionClosed(String),

    /// Operation timed out.
    #[error("operation timed out: {0}")]
    Timeout(String),

    /// Operation is not allowed in the current connection state.
    #[error("illegal state: {0}")]
    IllegalState(String),

    /// No connection is registered for the given peer.
    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    /// Transport-level I/O failure.
    #[error("i/o error: {0}")]
    Io(String),
}

impl ProtocolError {
    /// Convert a local dispatch error into the descriptor sent in an error reply.
    ///
    /// Structural errors that have no remote meaning collapse to `Internal`.
    pub fn to_remote(&self) -> RemoteError {
        let kind = match self {
            ProtocolError::NotExists(_) => RemoteErrorKind::NotExists,
            ProtocolError::InvalidAccess(_) => RemoteErrorKind::InvalidAccess,
            ProtocolError::Exists(_) => RemoteErrorKind::Exists,
            ProtocolError::NotImplemented(_) => RemoteErrorKind::NotImplemented,
            ProtocolError::Busy(_) => RemoteErrorKind::Busy,
            ProtocolError::MalformedFrame(_) | ProtocolError::Deserialization(_) => {
                RemoteErrorKind::InvalidArgument
            }
            ProtocolError::Remote(err) => return err.clone(),
            _ => RemoteErrorKind::Internal,
        };
        RemoteError::new(kind, self.to_string())
    }
}

/// Result type alias for protocol operations.
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Category of an error carried across the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RemoteErrorKind {
    /// Member, context or definition does not exist.
    NotExists,
    /// Write attempted on a read-only member.
    InvalidAccess,
    /// Resource already exists.
    Exists,
    /// Action is not supported by the peer.
    NotImplemented,
    /// Request payload has the wrong shape.
    InvalidArgument,
    /// Peer refused the request because it is at capacity.
    Busy,
    /// Failure inside the exposed object.
    Internal,
}

/// Error descriptor sent in a reply frame with `ERROR` status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
#[error("{kind:?}: {message}")]
pub struct RemoteError {
    /// Error category.
    pub kind: RemoteErrorKind,
    /// Human-readable message.
    pub message: String,
}

impl RemoteError {
    /// Create a new remote error.
    pub fn new(kind: RemoteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

// Conversions from underlying crate errors

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_data() || err.is_eof() || err.is_syntax() {
            ProtocolError::Deserialization(err.to_string())
        } else {
            ProtocolError::Serialization(err.to_string())
        }
    }
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Deserialization(err.to_string())
    }
}

impl From<std::io::Error> for ProtocolError {
    fn from(err: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match err.kind() {
            ErrorKind::TimedOut => ProtocolError::Timeout(err.to_string()),
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ProtocolError::ConnectionClosed(err.to_string()),
            _ => ProtocolError::Io(err.to_string()),
        }
    }
}
