//! Team-sharing wire protocol
//!
//! Every message, on the network and on the local relay bus, is the same
//! `{ "type": ..., "data": ... }` envelope serialized as JSON.
//!
//! ## Message Types
//!
//! - **telemetry**: filtered, flattened telemetry frame (host → guests, 5 Hz)
//! - **session**: filtered session snapshot (host → guests, every 2 s)
//! - **fuel_history**: fuel lap history owned by the fuel calculator
//! - **keep_alive**: host wall-clock timestamp in milliseconds
//! - **request_sync**: guest asks the host for full current state
//! - **status**: role/identity announcement between windows
//!
//! ## Message Flow
//!
//! ```text
//! Guest                           Host
//!   |                               |
//!   |  (connection opens)           |
//!   |<-- session ------------------|   sync-on-connect
//!   |<-- fuel_history -------------|
//!   |--- request_sync ------------>|
//!   |<-- session ------------------|
//!   |                               |
//!   |<-- telemetry (every tick) ---|
//!   |<-- keep_alive (every 5 s) ---|
//! ```
//!
//! There is no version field. Unknown `type` values decode to
//! [`SyncMessage::Unknown`] and are forwarded untouched, so new message types
//! can be introduced without breaking older peers.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{ShareError, ShareResult};
use crate::types::StatusSnapshot;

/// Flattened telemetry: whitelisted field name → scalar (or opaque) value
pub type TelemetryFrame = Map<String, Value>;

/// One fuel-calculator lap record. Its shape belongs to the fuel calculator.
pub type FuelLap = Value;

/// Driver section of a session snapshot with a bounded driver list
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DriverInfo {
    /// Driver entries, in simulator order
    #[serde(rename = "Drivers", default, skip_serializing_if = "Option::is_none")]
    pub drivers: Option<Vec<Value>>,
    /// Every other driver-info field, passed through untouched
    #[serde(flatten)]
    pub rest: Map<String, Value>,
}

/// Session snapshot as shared with teammates
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionFrame {
    #[serde(rename = "WeekendInfo", default, skip_serializing_if = "Option::is_none")]
    pub weekend_info: Option<Value>,
    #[serde(rename = "DriverInfo", default, skip_serializing_if = "Option::is_none")]
    pub driver_info: Option<DriverInfo>,
    #[serde(rename = "SessionInfo", default, skip_serializing_if = "Option::is_none")]
    pub session_info: Option<Value>,
}

/// Discriminant of a [`SyncMessage`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Telemetry,
    Session,
    FuelHistory,
    KeepAlive,
    RequestSync,
    Status,
    Unknown,
}

impl MessageKind {
    /// Wire tag for this kind (`"unknown"` for unrecognized tags)
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Telemetry => "telemetry",
            MessageKind::Session => "session",
            MessageKind::FuelHistory => "fuel_history",
            MessageKind::KeepAlive => "keep_alive",
            MessageKind::RequestSync => "request_sync",
            MessageKind::Status => "status",
            MessageKind::Unknown => "unknown",
        }
    }

    /// Parse a wire tag; unrecognized tags map to `Unknown`
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "telemetry" => MessageKind::Telemetry,
            "session" => MessageKind::Session,
            "fuel_history" => MessageKind::FuelHistory,
            "keep_alive" => MessageKind::KeepAlive,
            "request_sync" => MessageKind::RequestSync,
            "status" => MessageKind::Status,
            _ => MessageKind::Unknown,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A team-sharing message, one payload shape per tag
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawEnvelope", into = "RawEnvelope")]
pub enum SyncMessage {
    /// Filtered telemetry frame
    Telemetry(TelemetryFrame),
    /// Filtered session snapshot
    Session(SessionFrame),
    /// Fuel lap history
    FuelHistory(Vec<FuelLap>),
    /// Liveness beacon carrying the sender's clock in milliseconds
    KeepAlive(i64),
    /// Ask the host for full current state
    RequestSync,
    /// Role/identity announcement
    Status(StatusSnapshot),
    /// A tag this build does not understand, or a known tag whose payload did
    /// not have the expected shape
    Unknown {
        /// The `type` tag as received
        kind: String,
        /// The `data` payload as received
        data: Value,
    },
}

impl SyncMessage {
    /// Build a keep-alive stamped with the current wall-clock time
    pub fn keep_alive_now() -> Self {
        SyncMessage::KeepAlive(chrono::Utc::now().timestamp_millis())
    }

    /// Get the discriminant of this message
    pub fn kind(&self) -> MessageKind {
        match self {
            SyncMessage::Telemetry(_) => MessageKind::Telemetry,
            SyncMessage::Session(_) => MessageKind::Session,
            SyncMessage::FuelHistory(_) => MessageKind::FuelHistory,
            SyncMessage::KeepAlive(_) => MessageKind::KeepAlive,
            SyncMessage::RequestSync => MessageKind::RequestSync,
            SyncMessage::Status(_) => MessageKind::Status,
            SyncMessage::Unknown { .. } => MessageKind::Unknown,
        }
    }

    /// Encode message to JSON bytes
    pub fn encode(&self) -> ShareResult<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| ShareError::Serialization(format!("Failed to encode {} message: {}", self.kind(), e)))
    }

    /// Decode message from JSON bytes
    pub fn decode(bytes: &[u8]) -> ShareResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| ShareError::Serialization(format!("Failed to decode message: {}", e)))
    }
}

/// Untyped envelope used at the serde boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

impl From<RawEnvelope> for SyncMessage {
    fn from(raw: RawEnvelope) -> Self {
        let RawEnvelope { kind, data } = raw;
        match (MessageKind::from_tag(&kind), data) {
            (MessageKind::Telemetry, Value::Object(frame)) => SyncMessage::Telemetry(frame),
            (MessageKind::FuelHistory, Value::Array(laps)) => SyncMessage::FuelHistory(laps),
            (MessageKind::RequestSync, _) => SyncMessage::RequestSync,
            (MessageKind::KeepAlive, Value::Number(n)) => {
                match n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)) {
                    Some(ts) => SyncMessage::KeepAlive(ts),
                    None => SyncMessage::Unknown {
                        kind,
                        data: Value::Number(n),
                    },
                }
            }
            (MessageKind::Session, data @ Value::Object(_)) => {
                match serde_json::from_value(data.clone()) {
                    Ok(frame) => SyncMessage::Session(frame),
                    Err(_) => SyncMessage::Unknown { kind, data },
                }
            }
            (MessageKind::Status, data @ Value::Object(_)) => {
                match serde_json::from_value(data.clone()) {
                    Ok(status) => SyncMessage::Status(status),
                    Err(_) => SyncMessage::Unknown { kind, data },
                }
            }
            (_, data) => SyncMessage::Unknown { kind, data },
        }
    }
}

impl From<SyncMessage> for RawEnvelope {
    fn from(msg: SyncMessage) -> Self {
        let kind = msg.kind().as_str().to_string();
        match msg {
            SyncMessage::Telemetry(frame) => RawEnvelope {
                kind,
                data: Value::Object(frame),
            },
            SyncMessage::Session(frame) => RawEnvelope {
                kind,
                data: serde_json::to_value(frame).unwrap_or(Value::Null),
            },
            SyncMessage::FuelHistory(laps) => RawEnvelope {
                kind,
                data: Value::Array(laps),
            },
            SyncMessage::KeepAlive(ts) => RawEnvelope {
                kind,
                data: Value::from(ts),
            },
            SyncMessage::RequestSync => RawEnvelope {
                kind,
                data: Value::Object(Map::new()),
            },
            SyncMessage::Status(status) => RawEnvelope {
                kind,
                data: serde_json::to_value(status).unwrap_or(Value::Null),
            },
            SyncMessage::Unknown { kind, data } => RawEnvelope { kind, data },
        }
    }
}
