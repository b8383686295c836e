use std::time::Duration;

use thiserror::Error;

/// Failures that keep the secure datagram server from starting.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid listen address {0}")]
    InvalidAddress(String),
    #[error("failed to bind datagram socket on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to load transport credentials: {0}")]
    Credentials(String),
    #[error("unsupported cipher suite {0}")]
    CipherPolicy(String),
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),
}

/// Per-connection handshake failure. Only the affected client is dropped.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake timed out after {0:?}")]
    Timeout(Duration),
    #[error("handshake failed: {0}")]
    Failed(String),
    #[error("handshake cancelled")]
    Cancelled,
}

/// State of the outbound signaling link.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkError {
    #[error("signaling link is not connected")]
    Disconnected,
    #[error("signaling connect failed: {0}")]
    Connect(String),
    #[error("signaling connect timed out after {0:?}")]
    Timeout(Duration),
    #[error("signaling send failed: {0}")]
    Send(String),
}

#[derive(Debug, Error)]
pub enum RobotLinkError {
    #[error("robot link io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("robot link stopped")]
    Stopped,
}

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("malformed signaling message: {0}")]
    Protocol(String),
    #[error("no session {0}")]
    SessionNotFound(String),
    #[error("peer connection error: {0}")]
    PeerConnection(String),
    #[error("rejected wire frame: {0}")]
    Integrity(#[from] robot_wire::IntegrityError),
    #[error(transparent)]
    Robot(#[from] RobotLinkError),
}

impl RouterError {
    pub fn protocol(err: impl std::fmt::Display) -> Self {
        RouterError::Protocol(err.to_string())
    }

    pub fn peer(err: impl std::fmt::Display) -> Self {
        RouterError::PeerConnection(err.to_string())
    }
}
