use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorKind;
use crate::tracking::{
    LedgerStatistics, StatusChange, TrackingEvent, TrackingNumber, TrackingRecord,
    TrackingSnapshot,
};

const CLIENT_MESSAGE_TYPES: [&str; 7] = [
    "subscribe",
    "unsubscribe",
    "track",
    "join_room",
    "leave_room",
    "ping",
    "get_status",
];

#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    #[error("invalid message format: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message has no type")]
    MissingType,
    #[error("Unknown message type: {0}")]
    UnknownType(String),
}

impl MessageError {
    pub fn kind(&self) -> ErrorKind {
        ErrorKind::InvalidRequest
    }
}

/// Request sent by a realtime client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe {
        #[serde(default, alias = "trackingNumber")]
        tracking_number: Option<TrackingNumber>,
    },
    Unsubscribe {
        #[serde(default, alias = "trackingNumber")]
        tracking_number: Option<TrackingNumber>,
    },
    Track {
        #[serde(default, alias = "trackingNumber")]
        tracking_number: Option<TrackingNumber>,
    },
    JoinRoom {
        #[serde(default)]
        room: Option<String>,
    },
    LeaveRoom {
        #[serde(default)]
        room: Option<String>,
    },
    Ping,
    GetStatus,
}

impl ClientMessage {
    /// Unknown types are told apart from malformed payloads so the reply
    /// can name the offending type.
    pub fn parse(text: &str) -> Result<Self, MessageError> {
        let value: Value = serde_json::from_str(text)?;
        let message_type = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(MessageError::MissingType)?;
        if !CLIENT_MESSAGE_TYPES.contains(&message_type) {
            return Err(MessageError::UnknownType(message_type.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }
}

/// Counters reported in `system_status` frames.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct GatewayCounters {
    pub total_connections: u64,
    pub active_connections: u64,
    pub messages_received: u64,
    pub messages_sent: u64,
    pub errors: u64,
}

/// Frame pushed to a realtime client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "connection.ack")]
    ConnectionAck {
        client_id: String,
        status: &'static str,
        message: String,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "subscribed")]
    Subscribed {
        tracking_number: TrackingNumber,
        current_data: Box<TrackingSnapshot>,
        message: String,
    },
    #[serde(rename = "unsubscribed")]
    Unsubscribed {
        tracking_number: TrackingNumber,
        message: String,
    },
    #[serde(rename = "tracking_data")]
    TrackingData {
        tracking_number: TrackingNumber,
        data: Box<TrackingSnapshot>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "tracking_update")]
    TrackingUpdate {
        tracking_number: TrackingNumber,
        event: Box<TrackingEvent>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "status_update")]
    StatusUpdate {
        tracking_number: TrackingNumber,
        data: StatusChange,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "new_tracking")]
    NewTracking {
        data: Box<TrackingRecord>,
        timestamp: DateTime<Utc>,
    },
    #[serde(rename = "room_joined")]
    RoomJoined { room: String, message: String },
    #[serde(rename = "room_left")]
    RoomLeft { room: String, message: String },
    #[serde(rename = "pong")]
    Pong { timestamp: DateTime<Utc> },
    #[serde(rename = "error")]
    Error { kind: ErrorKind, message: String },
    #[serde(rename = "system_status")]
    SystemStatus {
        gateway: GatewayCounters,
        #[serde(skip_serializing_if = "Option::is_none")]
        tracking: Option<LedgerStatistics>,
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            kind,
            message: message.into(),
        }
    }

    pub const fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::ConnectionAck { .. } => "connection.ack",
            ServerMessage::Subscribed { .. } => "subscribed",
            ServerMessage::Unsubscribed { .. } => "unsubscribed",
            ServerMessage::TrackingData { .. } => "tracking_data",
            ServerMessage::TrackingUpdate { .. } => "tracking_update",
            ServerMessage::StatusUpdate { .. } => "status_update",
            ServerMessage::NewTracking { .. } => "new_tracking",
            ServerMessage::RoomJoined { .. } => "room_joined",
            ServerMessage::RoomLeft { .. } => "room_left",
            ServerMessage::Pong { .. } => "pong",
            ServerMessage::Error { .. } => "error",
            ServerMessage::SystemStatus { .. } => "system_status",
        }
    }
}

/// What the socket task should write next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Message(String),
    Ping,
    Close { code: u16, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_both_tracking_number_spellings() {
        let snake = ClientMessage::parse(r#"{"type":"subscribe","tracking_number":"T-1"}"#)
            .expect("snake case parses");
        let camel = ClientMessage::parse(r#"{"type":"subscribe","trackingNumber":"T-1"}"#)
            .expect("camel case parses");
        assert_eq!(snake, camel);
        assert_eq!(
            snake,
            ClientMessage::Subscribe {
                tracking_number: Some(TrackingNumber::from("T-1"))
            }
        );
    }

    #[test]
    fn separates_unknown_types_from_garbage() {
        assert!(matches!(
            ClientMessage::parse(r#"{"type":"dance"}"#),
            Err(MessageError::UnknownType(kind)) if kind == "dance"
        ));
        assert!(matches!(
            ClientMessage::parse("not json"),
            Err(MessageError::Malformed(_))
        ));
        assert!(matches!(
            ClientMessage::parse(r#"{"room":"ops"}"#),
            Err(MessageError::MissingType)
        ));
        assert_eq!(
            ClientMessage::parse(r#"{"type":"ping"}"#).expect("ping parses"),
            ClientMessage::Ping
        );
    }

    #[test]
    fn server_frames_carry_wire_type() {
        let frame = ServerMessage::error(ErrorKind::NotFound, "missing");
        let value = serde_json::to_value(&frame).expect("serialize");
        assert_eq!(value["type"], "error");
        assert_eq!(value["kind"], "not_found");
        assert_eq!(frame.type_name(), "error");

        let ack = ServerMessage::ConnectionAck {
            client_id: "c-1".to_string(),
            status: "connected",
            message: "hello".to_string(),
            timestamp: Utc::now(),
        };
        let value = serde_json::to_value(&ack).expect("serialize");
        assert_eq!(value["type"], "connection.ack");
        assert_eq!(value["client_id"], "c-1");
    }
}
