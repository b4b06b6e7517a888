use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::connection::ConnectionHandle;
use crate::error::BrokerError;
use crate::tier::Tier;

/// Control Plane request. The correlation id is echoed in the response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeRequest {
    pub id: Uuid,
    #[serde(flatten)]
    pub op: BridgeOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum BridgeOp {
    /// Inject a message as if from the system.
    Broadcast { channel: String, payload: Value },
    GetStatus,
    Start,
    Stop,
    Restart,
}

impl BridgeOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Broadcast { .. } => "broadcast",
            Self::GetStatus => "get_status",
            Self::Start => "start",
            Self::Stop => "stop",
            Self::Restart => "restart",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeResponse {
    pub id: Uuid,
    #[serde(flatten)]
    pub outcome: BridgeOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum BridgeOutcome {
    Ok {
        #[serde(default, skip_serializing_if = "Value::is_null")]
        data: Value,
    },
    Error {
        error: String,
        code: String,
    },
}

impl BridgeResponse {
    pub fn ok(id: Uuid, data: Value) -> Self {
        Self {
            id,
            outcome: BridgeOutcome::Ok { data },
        }
    }

    pub fn error(id: Uuid, err: &BrokerError) -> Self {
        Self {
            id,
            outcome: BridgeOutcome::Error {
                error: err.client_message(),
                code: err.code().to_string(),
            },
        }
    }
}

/// Audit notification flowing outward to the Control Plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeNotification {
    pub event: String,
    pub connection_id: Uuid,
    pub identity: Option<String>,
    pub tier: Tier,
    pub timestamp: i64,
}

impl BridgeNotification {
    pub fn opened(handle: &ConnectionHandle) -> Self {
        Self::for_event("connection.opened", handle)
    }

    pub fn closed(handle: &ConnectionHandle) -> Self {
        Self::for_event("connection.closed", handle)
    }

    fn for_event(event: &str, handle: &ConnectionHandle) -> Self {
        Self {
            event: event.to_string(),
            connection_id: handle.id,
            identity: handle.identity.clone(),
            tier: handle.tier,
            timestamp: Utc::now().timestamp_millis(),
        }
    }
}
