use serde::{Deserialize, Serialize};

use crate::digest::{hash, verify, DIGEST_LEN};
use crate::IntegrityError;

pub const PROTOCOL_VERSION: u8 = 1;
pub const HEADER_LEN: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum MessageType {
    Undefined = 0,
    Log = 1,
    Heartbeat = 2,
    Command = 3,
    Status = 4,
    #[serde(rename = "estop")]
    EStop = 6,
}

impl MessageType {
    pub fn code(self) -> u8 {
        self as u8
    }
}

impl TryFrom<u8> for MessageType {
    type Error = IntegrityError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(MessageType::Undefined),
            1 => Ok(MessageType::Log),
            2 => Ok(MessageType::Heartbeat),
            3 => Ok(MessageType::Command),
            4 => Ok(MessageType::Status),
            6 => Ok(MessageType::EStop),
            other => Err(IntegrityError::UnknownType(other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub version: u8,
    pub message_type: MessageType,
    pub payload_length: u16,
}

impl MessageHeader {
    /// Header of a message that has not been through `prepare` yet.
    pub const fn unstamped() -> Self {
        Self {
            version: 0,
            message_type: MessageType::Undefined,
            payload_length: 0,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_LEN] {
        let length = self.payload_length.to_le_bytes();
        [self.version, self.message_type.code(), length[0], length[1]]
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, IntegrityError> {
        if bytes.len() < HEADER_LEN {
            return Err(IntegrityError::Truncated {
                expected: HEADER_LEN,
                actual: bytes.len(),
            });
        }
        Ok(Self {
            version: bytes[0],
            message_type: MessageType::try_from(bytes[1])?,
            payload_length: u16::from_le_bytes([bytes[2], bytes[3]]),
        })
    }
}

/// A fixed-size payload carried inside a [`WireMessage`].
///
/// `encode` must append exactly `LEN` bytes and `decode` is only ever handed
/// a slice of exactly `LEN` bytes. The encoding has to be bijective so that a
/// flipped byte never decodes back to an identical value.
pub trait WirePayload: Sized {
    const MESSAGE_TYPE: MessageType;
    const LEN: usize;

    fn encode(&self, out: &mut Vec<u8>);
    fn decode(bytes: &[u8]) -> Self;
}

/// Header, typed payload and trailing digest.
///
/// Fields are only reachable through accessors: a message is stamped by
/// [`WireMessage::prepare`] right before it is sent and is immutable after
/// [`WireMessage::decode_valid`] accepts it.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage<T> {
    header: MessageHeader,
    payload: T,
    digest: [u8; DIGEST_LEN],
}

impl<T: WirePayload> WireMessage<T> {
    pub const FRAME_LEN: usize = HEADER_LEN + T::LEN + DIGEST_LEN;

    pub fn new(payload: T) -> Self {
        Self {
            header: MessageHeader::unstamped(),
            payload,
            digest: [0u8; DIGEST_LEN],
        }
    }

    /// Builds and stamps a message with the payload's static type and size.
    pub fn sealed(payload: T) -> Self {
        let mut message = Self::new(payload);
        message.prepare(T::MESSAGE_TYPE, T::LEN as u16);
        message
    }

    /// Stamps version, type and declared length, then computes the digest
    /// over the header and payload bytes.
    pub fn prepare(&mut self, message_type: MessageType, payload_length: u16) {
        self.header = MessageHeader {
            version: PROTOCOL_VERSION,
            message_type,
            payload_length,
        };
        self.digest = hash(&self.signed_bytes());
    }

    pub fn is_valid(&self) -> bool {
        self.check().is_ok()
    }

    /// Same checks as [`WireMessage::is_valid`], reporting the first failure.
    pub fn check(&self) -> Result<(), IntegrityError> {
        if self.header.version != PROTOCOL_VERSION {
            return Err(IntegrityError::VersionMismatch(self.header.version));
        }
        if self.header.message_type != T::MESSAGE_TYPE {
            return Err(IntegrityError::TypeMismatch {
                expected: T::MESSAGE_TYPE,
                actual: self.header.message_type,
            });
        }
        if usize::from(self.header.payload_length) != T::LEN {
            return Err(IntegrityError::LengthMismatch {
                declared: self.header.payload_length,
                expected: T::LEN,
            });
        }
        if !verify(&self.signed_bytes(), &self.digest) {
            return Err(IntegrityError::DigestMismatch);
        }
        Ok(())
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = self.signed_bytes();
        out.extend_from_slice(&self.digest);
        out
    }

    /// Parses a frame without validating it.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, IntegrityError> {
        if bytes.len() != Self::FRAME_LEN {
            return Err(IntegrityError::Truncated {
                expected: Self::FRAME_LEN,
                actual: bytes.len(),
            });
        }
        let header = MessageHeader::decode(bytes)?;
        let payload_end = HEADER_LEN + T::LEN;
        let payload = T::decode(&bytes[HEADER_LEN..payload_end]);
        let mut digest = [0u8; DIGEST_LEN];
        digest.copy_from_slice(&bytes[payload_end..]);
        Ok(Self {
            header,
            payload,
            digest,
        })
    }

    /// Parses a received frame and rejects it unless it is valid.
    pub fn decode_valid(bytes: &[u8]) -> Result<Self, IntegrityError> {
        let message = Self::from_bytes(bytes)?;
        message.check()?;
        Ok(message)
    }

    pub fn header(&self) -> &MessageHeader {
        &self.header
    }

    pub fn payload(&self) -> &T {
        &self.payload
    }

    pub fn into_payload(self) -> T {
        self.payload
    }

    pub fn digest(&self) -> &[u8; DIGEST_LEN] {
        &self.digest
    }

    fn signed_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_LEN + T::LEN + DIGEST_LEN);
        out.extend_from_slice(&self.header.encode());
        self.payload.encode(&mut out);
        out
    }
}

/// Reads the message type of a raw frame so the receiver can pick the
/// payload type to decode it with.
pub fn peek_type(bytes: &[u8]) -> Result<MessageType, IntegrityError> {
    MessageHeader::decode(bytes).map(|header| header.message_type)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payload::{MotorCommand, Status};

    #[test]
    fn prepared_message_is_valid() {
        let message = WireMessage::sealed(MotorCommand {
            left_speed: 60,
            right_speed: 40,
        });
        assert!(message.is_valid());
        assert_eq!(message.header().version, PROTOCOL_VERSION);
        assert_eq!(message.header().message_type, MessageType::Command);
        assert_eq!(message.header().payload_length, 2);

        let bytes = message.to_bytes();
        assert_eq!(bytes.len(), WireMessage::<MotorCommand>::FRAME_LEN);
        assert_eq!(&bytes[..4], &[1, 3, 2, 0]);

        let decoded = WireMessage::<MotorCommand>::decode_valid(&bytes).expect("valid frame");
        assert_eq!(decoded, message);
    }

    #[test]
    fn unprepared_message_is_invalid() {
        let message = WireMessage::new(MotorCommand {
            left_speed: 1,
            right_speed: 1,
        });
        assert!(!message.is_valid());
    }

    #[test]
    fn any_flipped_payload_or_digest_byte_invalidates() {
        let bytes = WireMessage::sealed(Status {
            voltage: 12.4,
            current: 3.1,
            power: 38.44,
            driver_faults: 0,
            power_domains: 0b111,
        })
        .to_bytes();

        for index in HEADER_LEN..bytes.len() {
            for bit in 0..8 {
                let mut tampered = bytes.clone();
                tampered[index] ^= 1 << bit;
                let valid = WireMessage::<Status>::from_bytes(&tampered)
                    .map(|message| message.is_valid())
                    .unwrap_or(false);
                assert!(!valid, "flip of bit {bit} at byte {index} went unnoticed");
            }
        }
    }

    #[test]
    fn header_checks_are_reported() {
        let mut message = WireMessage::new(MotorCommand {
            left_speed: 0,
            right_speed: 0,
        });

        message.prepare(MessageType::Command, 7);
        assert_eq!(
            message.check(),
            Err(IntegrityError::LengthMismatch {
                declared: 7,
                expected: 2
            })
        );

        message.prepare(MessageType::Undefined, 2);
        assert!(matches!(
            message.check(),
            Err(IntegrityError::TypeMismatch { .. })
        ));

        let mut bytes = WireMessage::sealed(MotorCommand {
            left_speed: 0,
            right_speed: 0,
        })
        .to_bytes();
        bytes[0] = 2;
        assert_eq!(
            WireMessage::<MotorCommand>::decode_valid(&bytes),
            Err(IntegrityError::VersionMismatch(2))
        );

        bytes[1] = 5;
        assert_eq!(peek_type(&bytes), Err(IntegrityError::UnknownType(5)));
    }

    #[test]
    fn rejects_short_frames() {
        assert_eq!(
            WireMessage::<MotorCommand>::from_bytes(&[1, 3, 2]),
            Err(IntegrityError::Truncated {
                expected: WireMessage::<MotorCommand>::FRAME_LEN,
                actual: 3
            })
        );
        assert!(peek_type(&[1]).is_err());
    }
}
