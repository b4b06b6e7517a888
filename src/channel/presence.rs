use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::BrokerError;
use crate::websocket::{PresenceEntry, ServerMessage};

#[derive(Deserialize)]
struct PresenceEvent {
    action: String,
    user: String,
}

/// Presence processing: `join` upserts the user, `leave` removes it; every
/// mutation broadcasts the full registry.
pub(super) fn process(
    active: &RwLock<HashMap<String, DateTime<Utc>>>,
    event: &Value,
) -> Result<ServerMessage, BrokerError> {
    let event: PresenceEvent = serde_json::from_value(event.clone())
        .map_err(|e| BrokerError::InvalidEvent(format!("presence event: {e}")))?;

    if event.user.is_empty() {
        return Err(BrokerError::InvalidEvent("presence user is empty".to_string()));
    }

    {
        let mut registry = active
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        match event.action.as_str() {
            "join" => {
                registry.insert(event.user, Utc::now());
            }
            "leave" => {
                registry.remove(&event.user);
            }
            other => {
                return Err(BrokerError::InvalidEvent(format!(
                    "unknown presence action: {other}"
                )));
            }
        }
    }

    Ok(snapshot(active))
}

fn snapshot(active: &RwLock<HashMap<String, DateTime<Utc>>>) -> ServerMessage {
    let registry = active
        .read()
        .unwrap_or_else(std::sync::PoisonError::into_inner);
    let mut users: Vec<PresenceEntry> = registry
        .iter()
        .map(|(user, joined_at)| PresenceEntry {
            user: user.clone(),
            joined_at: joined_at.timestamp_millis(),
        })
        .collect();
    users.sort_by_key(|entry| entry.joined_at);

    ServerMessage::PresenceUpdate {
        users,
        timestamp: Utc::now().timestamp_millis(),
    }
}
