use serde::{Deserialize, Serialize};

use crate::message::{MessageType, WirePayload};

pub const LOG_TEXT_LEN: usize = 63;

/// Differential drive command, one signed speed per side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotorCommand {
    pub left_speed: i8,
    pub right_speed: i8,
}

impl MotorCommand {
    /// Mixes a power/turn pair into per-side speeds, saturating at the i8
    /// range.
    pub fn from_drive(power: i8, turn: i8) -> Self {
        let power = i16::from(power);
        let turn = i16::from(turn);
        Self {
            left_speed: saturate(power + turn),
            right_speed: saturate(power - turn),
        }
    }

    pub fn stop() -> Self {
        Self {
            left_speed: 0,
            right_speed: 0,
        }
    }
}

fn saturate(value: i16) -> i8 {
    value.clamp(i16::from(i8::MIN), i16::from(i8::MAX)) as i8
}

impl WirePayload for MotorCommand {
    const MESSAGE_TYPE: MessageType = MessageType::Command;
    const LEN: usize = 2;

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.left_speed as u8);
        out.push(self.right_speed as u8);
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            left_speed: bytes[0] as i8,
            right_speed: bytes[1] as i8,
        }
    }
}

/// Power telemetry reported by the robot.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Status {
    pub voltage: f32,
    pub current: f32,
    pub power: f32,
    pub driver_faults: u8,
    pub power_domains: u8,
}

impl Status {
    pub const DOMAIN_COMPUTE: u8 = 0b001;
    pub const DOMAIN_HIGH_VOLTAGE: u8 = 0b010;
    pub const DOMAIN_MOTOR_DRIVERS: u8 = 0b100;

    pub const LOW_VOLTAGE_THRESHOLD: f32 = 10.5;
    pub const OVERCURRENT_THRESHOLD: f32 = 15.0;

    pub fn is_low_voltage(&self) -> bool {
        self.voltage < Self::LOW_VOLTAGE_THRESHOLD
    }

    pub fn is_overcurrent(&self) -> bool {
        self.current > Self::OVERCURRENT_THRESHOLD
    }

    pub fn domain_enabled(&self, domain: u8) -> bool {
        self.power_domains & domain == domain
    }
}

impl WirePayload for Status {
    const MESSAGE_TYPE: MessageType = MessageType::Status;
    const LEN: usize = 14;

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.voltage.to_le_bytes());
        out.extend_from_slice(&self.current.to_le_bytes());
        out.extend_from_slice(&self.power.to_le_bytes());
        out.push(self.driver_faults);
        out.push(self.power_domains);
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            voltage: f32::from_le_bytes(array_at(bytes, 0)),
            current: f32::from_le_bytes(array_at(bytes, 4)),
            power: f32::from_le_bytes(array_at(bytes, 8)),
            driver_faults: bytes[12],
            power_domains: bytes[13],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub sequence: u32,
    pub uptime_ms: u32,
}

impl WirePayload for Heartbeat {
    const MESSAGE_TYPE: MessageType = MessageType::Heartbeat;
    const LEN: usize = 8;

    fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.sequence.to_le_bytes());
        out.extend_from_slice(&self.uptime_ms.to_le_bytes());
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            sequence: u32::from_le_bytes(array_at(bytes, 0)),
            uptime_ms: u32::from_le_bytes(array_at(bytes, 4)),
        }
    }
}

/// A short log record, NUL padded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogLine {
    pub level: u8,
    pub text: [u8; LOG_TEXT_LEN],
}

impl LogLine {
    /// Truncates `text` at a character boundary to fit the fixed field.
    pub fn new(level: u8, text: &str) -> Self {
        let mut end = text.len().min(LOG_TEXT_LEN);
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        let mut buf = [0u8; LOG_TEXT_LEN];
        buf[..end].copy_from_slice(&text.as_bytes()[..end]);
        Self { level, text: buf }
    }

    pub fn text(&self) -> String {
        let end = self
            .text
            .iter()
            .position(|byte| *byte == 0)
            .unwrap_or(LOG_TEXT_LEN);
        String::from_utf8_lossy(&self.text[..end]).into_owned()
    }
}

impl WirePayload for LogLine {
    const MESSAGE_TYPE: MessageType = MessageType::Log;
    const LEN: usize = 1 + LOG_TEXT_LEN;

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.level);
        out.extend_from_slice(&self.text);
    }

    fn decode(bytes: &[u8]) -> Self {
        Self {
            level: bytes[0],
            text: array_at(bytes, 1),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EStop {
    pub reason: u8,
}

impl EStop {
    pub const REASON_OPERATOR: u8 = 1;
    pub const REASON_LINK_LOST: u8 = 2;
    pub const REASON_FAULT: u8 = 3;
}

impl WirePayload for EStop {
    const MESSAGE_TYPE: MessageType = MessageType::EStop;
    const LEN: usize = 1;

    fn encode(&self, out: &mut Vec<u8>) {
        out.push(self.reason);
    }

    fn decode(bytes: &[u8]) -> Self {
        Self { reason: bytes[0] }
    }
}

fn array_at<const N: usize>(bytes: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[offset..offset + N]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WireMessage;

    #[test]
    fn drive_mixing_matches_reference_scenarios() {
        assert_eq!(
            MotorCommand::from_drive(50, 10),
            MotorCommand {
                left_speed: 60,
                right_speed: 40
            }
        );
        assert_eq!(
            MotorCommand::from_drive(120, 50),
            MotorCommand {
                left_speed: 127,
                right_speed: 70
            }
        );
        assert_eq!(
            MotorCommand::from_drive(-128, 127),
            MotorCommand {
                left_speed: -1,
                right_speed: -128
            }
        );
    }

    #[test]
    fn encoded_lengths_match_declared_lengths() {
        fn encoded_len<T: WirePayload>(payload: &T) -> usize {
            let mut out = Vec::new();
            payload.encode(&mut out);
            out.len()
        }

        assert_eq!(encoded_len(&MotorCommand::stop()), MotorCommand::LEN);
        assert_eq!(
            encoded_len(&Heartbeat {
                sequence: 9,
                uptime_ms: 1_000
            }),
            Heartbeat::LEN
        );
        assert_eq!(encoded_len(&LogLine::new(2, "boot")), LogLine::LEN);
        assert_eq!(encoded_len(&EStop { reason: 1 }), EStop::LEN);
    }

    #[test]
    fn status_frame_preserves_telemetry() {
        let status = Status {
            voltage: 10.2,
            current: 16.5,
            power: 168.3,
            driver_faults: 0b10,
            power_domains: Status::DOMAIN_COMPUTE | Status::DOMAIN_MOTOR_DRIVERS,
        };
        let bytes = WireMessage::sealed(status).to_bytes();
        let decoded = WireMessage::<Status>::decode_valid(&bytes)
            .expect("valid status frame")
            .into_payload();

        assert_eq!(decoded, status);
        assert!(decoded.is_low_voltage());
        assert!(decoded.is_overcurrent());
        assert!(decoded.domain_enabled(Status::DOMAIN_MOTOR_DRIVERS));
        assert!(!decoded.domain_enabled(Status::DOMAIN_HIGH_VOLTAGE));
    }

    #[test]
    fn log_line_truncates_on_char_boundary() {
        let long = "é".repeat(40);
        let line = LogLine::new(1, &long);
        assert_eq!(line.text(), "é".repeat(31));
        assert_eq!(LogLine::new(1, "motor fault").text(), "motor fault");
    }
}
