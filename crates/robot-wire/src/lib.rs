//! Binary envelope shared by the relay and the robot control link.
//!
//! Every frame is `header | payload | digest`: a four byte header
//! (`version`, `message_type`, little-endian `payload_length`), a fixed
//! layout payload selected by the message type, and a SHA-256 digest over
//! everything before it.

mod digest;
mod message;
mod payload;

pub use digest::{hash, verify, DIGEST_LEN};
pub use message::{
    peek_type, MessageHeader, MessageType, WireMessage, WirePayload, HEADER_LEN,
    PROTOCOL_VERSION,
};
pub use payload::{EStop, Heartbeat, LogLine, MotorCommand, Status, LOG_TEXT_LEN};

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IntegrityError {
    #[error("frame truncated: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("unsupported protocol version {0}")]
    VersionMismatch(u8),
    #[error("expected {expected:?} frame, got {actual:?}")]
    TypeMismatch {
        expected: MessageType,
        actual: MessageType,
    },
    #[error("declared payload length {declared} does not match {expected}")]
    LengthMismatch { declared: u16, expected: usize },
    #[error("digest mismatch")]
    DigestMismatch,
}
