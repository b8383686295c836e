//! JSON vocabulary spoken over the signaling trunk and browser data channels.

use std::time::{SystemTime, UNIX_EPOCH};

use robot_wire::{MotorCommand, Status};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::RouterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Ping,
    PingResponse,
    Control,
    Sdp,
    Ice,
    RobotAssign,
    Auth,
    Unknown,
}

impl SignalKind {
    pub fn parse(name: &str) -> Self {
        match name {
            "ping" => SignalKind::Ping,
            "ping:resp" => SignalKind::PingResponse,
            "control" => SignalKind::Control,
            "webrtc:sdp" => SignalKind::Sdp,
            "webrtc:ice" => SignalKind::Ice,
            "robot:assign" => SignalKind::RobotAssign,
            "user:auth" => SignalKind::Auth,
            _ => SignalKind::Unknown,
        }
    }
}

/// A decoded message whose `type` has been read but whose body has not been
/// checked against that type yet.
#[derive(Debug, Clone)]
pub struct Envelope {
    pub kind: SignalKind,
    pub type_name: String,
    pub body: Value,
}

impl Envelope {
    pub fn parse(text: &str) -> Result<Self, RouterError> {
        let body: Value = serde_json::from_str(text).map_err(RouterError::protocol)?;
        let type_name = body
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| RouterError::Protocol("missing string field `type`".into()))?
            .to_owned();
        Ok(Self {
            kind: SignalKind::parse(&type_name),
            type_name,
            body,
        })
    }

    /// Deserializes the body into the typed form of this message.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, RouterError> {
        T::deserialize(&self.body)
            .map_err(|err| RouterError::Protocol(format!("{}: {err}", self.type_name)))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SdpOffer {
    pub sessionid: String,
    pub sdp: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RemoteCandidate {
    pub sessionid: String,
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlInput {
    pub power: i8,
    pub turn: i8,
    #[serde(default)]
    pub sessionid: Option<String>,
}

impl ControlInput {
    pub fn to_motor_command(&self) -> MotorCommand {
        MotorCommand::from_drive(self.power, self.turn)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RobotAssign {
    pub sessionid: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthResult {
    #[serde(default)]
    pub success: Option<bool>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Ping {
    pub timestamp: u64,
}

/// Messages the relay originates.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum OutboundSignal {
    #[serde(rename = "webrtc:sdp")]
    Sdp { sessionid: String, sdp: String },
    #[serde(rename = "webrtc:ice")]
    Ice {
        sessionid: String,
        candidate: String,
        #[serde(rename = "sdpMid")]
        sdp_mid: String,
        #[serde(rename = "sdpMLineIndex")]
        sdp_mline_index: u16,
    },
    #[serde(rename = "user:auth")]
    Auth { username: String, password: String },
    #[serde(rename = "ping")]
    Ping { timestamp: u64 },
    #[serde(rename = "telemetry")]
    Telemetry {
        voltage: f32,
        current: f32,
        power: f32,
        #[serde(rename = "driverFaults")]
        driver_faults: u8,
        #[serde(rename = "powerDomains")]
        power_domains: u8,
        #[serde(rename = "lowVoltage")]
        low_voltage: bool,
        overcurrent: bool,
    },
    #[serde(rename = "estop")]
    EStop { reason: u8 },
}

impl OutboundSignal {
    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn telemetry(status: &Status) -> Self {
        OutboundSignal::Telemetry {
            voltage: status.voltage,
            current: status.current,
            power: status.power,
            driver_faults: status.driver_faults,
            power_domains: status.power_domains,
            low_voltage: status.is_low_voltage(),
            overcurrent: status.is_overcurrent(),
        }
    }
}

/// Builds the `ping:resp` for `original`: the original fields, the received
/// timestamp echoed as `incomingTimestamp` and our own `timestampResp`.
pub fn ping_response(original: &Value, timestamp: u64, now: u64) -> Value {
    let mut reply = match original {
        Value::Object(fields) => fields.clone(),
        _ => Map::new(),
    };
    reply.insert("type".into(), Value::from("ping:resp"));
    reply.insert("incomingTimestamp".into(), Value::from(timestamp));
    reply.insert("timestampResp".into(), Value::from(now));
    Value::Object(reply)
}

pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelope_requires_a_type() {
        assert!(matches!(
            Envelope::parse(r#"{"power": 1}"#),
            Err(RouterError::Protocol(_))
        ));
        assert!(matches!(
            Envelope::parse("not json"),
            Err(RouterError::Protocol(_))
        ));
        let envelope = Envelope::parse(r#"{"type":"robot:dance"}"#).expect("parse");
        assert_eq!(envelope.kind, SignalKind::Unknown);
        assert_eq!(envelope.type_name, "robot:dance");
    }

    #[test]
    fn control_rejects_out_of_range_values() {
        let envelope = Envelope::parse(r#"{"type":"control","power":200,"turn":0}"#).expect("parse");
        assert!(envelope.decode::<ControlInput>().is_err());

        let envelope = Envelope::parse(r#"{"type":"control","power":-128,"turn":127}"#).expect("parse");
        let input: ControlInput = envelope.decode().expect("in range");
        assert_eq!(input.to_motor_command().left_speed, -1);
    }

    #[test]
    fn outbound_ice_uses_browser_field_names() {
        let message = OutboundSignal::Ice {
            sessionid: "s1".into(),
            candidate: "candidate:1 1 udp 2122260223 10.0.0.2 50000 typ host".into(),
            sdp_mid: "0".into(),
            sdp_mline_index: 0,
        };
        let value: Value = serde_json::from_str(&message.encode().expect("encode")).expect("json");
        assert_eq!(value["type"], "webrtc:ice");
        assert_eq!(value["sdpMid"], "0");
        assert_eq!(value["sdpMLineIndex"], 0);
    }

    #[test]
    fn ping_response_echoes_original() {
        let original = json!({"type": "ping", "timestamp": 1000});
        let reply = ping_response(&original, 1000, 1234);
        assert_eq!(
            reply,
            json!({
                "type": "ping:resp",
                "timestamp": 1000,
                "incomingTimestamp": 1000,
                "timestampResp": 1234
            })
        );
    }
}
