use chrono::Utc;
use serde_json::Value;

use crate::error::BrokerError;
use crate::websocket::ServerMessage;

use super::EventOrigin;

/// Status processing: re-broadcast the payload tagged with the sender and a
/// server timestamp. The only validation is that a payload is present and
/// the sender is an authenticated connection.
pub(super) fn process(origin: &EventOrigin, event: &Value) -> Result<ServerMessage, BrokerError> {
    let user = origin
        .identity
        .clone()
        .ok_or_else(|| {
            BrokerError::InvalidEvent("status requires an authenticated connection".to_string())
        })?;

    if event.is_null() {
        return Err(BrokerError::InvalidEvent("status payload is missing".to_string()));
    }

    Ok(ServerMessage::Status {
        data: event.clone(),
        user,
        timestamp: Utc::now().timestamp_millis(),
    })
}
