use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::stats::StatsSnapshot;
use crate::tier::Tier;

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Join { room: String },
    Leave { room: String },
    Publish {
        channel: String,
        #[serde(default)]
        event: Value,
    },
    Ping,
}

/// A user visible in a presence broadcast.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEntry {
    pub user: String,
    pub joined_at: i64,
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake acknowledgment carrying the tier the connection landed on.
    Connected { connection_id: Uuid, tier: Tier },
    Message {
        data: Value,
        user: Option<String>,
        timestamp: i64,
    },
    PresenceUpdate {
        users: Vec<PresenceEntry>,
        timestamp: i64,
    },
    Status {
        data: Value,
        user: String,
        timestamp: i64,
    },
    StatsUpdate {
        #[serde(flatten)]
        snapshot: StatsSnapshot,
    },
    Subscribed { channel: String },
    Unsubscribed { channel: String },
    Joined { room: String },
    Left { room: String },
    Pong,
    Heartbeat,
    Shutdown { reconnect_after_secs: u64 },
    Error { error: String, code: String },
}

impl ServerMessage {
    pub fn error(err: &BrokerError) -> Self {
        Self::Error {
            error: err.client_message(),
            code: err.code().to_string(),
        }
    }
}

/// Outbound payload on a connection's queue. Fan-out paths serialize once
/// and share the result; single-recipient acks skip the extra allocation.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    Raw(ServerMessage),
    Preserialized(Arc<str>),
}

impl OutboundMessage {
    pub fn preserialized(message: &ServerMessage) -> Result<Self, serde_json::Error> {
        Ok(Self::Preserialized(Arc::from(
            serde_json::to_string(message)?.into_boxed_str(),
        )))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        match self {
            Self::Raw(message) => serde_json::to_string(message),
            Self::Preserialized(json) => Ok(json.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_wire_shape() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"publish","channel":"message","event":"hi"}"#)
                .unwrap();
        assert!(matches!(msg, ClientMessage::Publish { ref channel, .. } if channel == "message"));

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));
    }

    #[test]
    fn test_error_event_shape() {
        let err = BrokerError::RateLimitExceeded { retry_after_secs: 30 };
        let json = serde_json::to_value(ServerMessage::error(&err)).unwrap();
        assert_eq!(json["type"], "error");
        assert_eq!(json["code"], "RATE_LIMIT_EXCEEDED");
        assert!(json["error"].as_str().unwrap().contains("30"));
    }

    #[test]
    fn test_preserialized_round_trip() {
        let message = ServerMessage::Pong;
        let outbound = OutboundMessage::preserialized(&message).unwrap();
        assert_eq!(outbound.to_json().unwrap(), r#"{"type":"pong"}"#);
    }
}
