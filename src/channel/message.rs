use chrono::Utc;
use serde_json::Value;

use crate::error::BrokerError;
use crate::websocket::ServerMessage;

use super::EventOrigin;

/// Chat message processing: content must be non-empty; anything else is
/// wrapped and broadcast as-is.
pub(super) fn process(origin: &EventOrigin, event: &Value) -> Result<ServerMessage, BrokerError> {
    if is_empty(event) {
        return Err(BrokerError::InvalidEvent("empty message".to_string()));
    }

    Ok(ServerMessage::Message {
        data: event.clone(),
        user: origin.identity.clone(),
        timestamp: Utc::now().timestamp_millis(),
    })
}

fn is_empty(event: &Value) -> bool {
    match event {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Object(map) => match map.get("content") {
            // An envelope with a `content` field is judged by its content.
            Some(content) => is_empty(content),
            None => map.is_empty(),
        },
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}
