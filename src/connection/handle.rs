use std::collections::HashSet;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::channel::EventOrigin;
use crate::tier::{Capability, Tier};
use crate::websocket::{OutboundMessage, ServerMessage};

/// Handle for a single live transport connection.
///
/// Exactly one registry entry exists per transport connection; the handle
/// owns the bounded outbound queue and the connection's own view of its
/// room memberships.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: Uuid,
    /// `None` for anonymous connections.
    pub identity: Option<String>,
    pub tier: Tier,
    pub capabilities: Vec<Capability>,
    sender: mpsc::Sender<OutboundMessage>,
    pub connected_at: DateTime<Utc>,
    /// Last activity timestamp (Unix seconds), lock-free updates.
    last_activity: AtomicI64,
    rooms: RwLock<HashSet<String>>,
    /// Cumulative sends dropped because the outbound queue was full.
    drops: AtomicU64,
}

impl ConnectionHandle {
    pub fn new(
        identity: Option<String>,
        tier: Tier,
        capabilities: Vec<Capability>,
        sender: mpsc::Sender<OutboundMessage>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            identity,
            tier,
            capabilities,
            sender,
            connected_at: now,
            last_activity: AtomicI64::new(now.timestamp()),
            rooms: RwLock::new(HashSet::new()),
            drops: AtomicU64::new(0),
        }
    }

    pub fn update_activity(&self) {
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn last_activity(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(self.last_activity.load(Ordering::Relaxed), 0)
            .unwrap_or_else(Utc::now)
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.tier == Tier::Admin || self.capabilities.contains(&cap)
    }

    /// Rate-limit identity: the user id when known, otherwise the
    /// connection id, so anonymous connections never share a window.
    pub fn rate_key(&self) -> String {
        match &self.identity {
            Some(identity) => format!("user:{identity}"),
            None => format!("anon:{}", self.id),
        }
    }

    pub fn origin(&self) -> EventOrigin {
        EventOrigin::connection(self.id, self.identity.clone(), self.tier)
    }

    /// Queue a message without blocking. A full queue counts toward the
    /// connection's drop budget; delivery is fire-and-forget per subscriber.
    pub fn try_send(&self, message: OutboundMessage) -> bool {
        match self.sender.try_send(message) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.drops.fetch_add(1, Ordering::Relaxed);
                crate::metrics::BROADCAST_DROPS.inc();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Send a direct acknowledgment to this connection, waiting for queue
    /// space. Used on the connection's own command path, never in fan-out.
    pub async fn send(
        &self,
        message: ServerMessage,
    ) -> Result<(), mpsc::error::SendError<OutboundMessage>> {
        self.sender.send(OutboundMessage::Raw(message)).await
    }

    pub fn drop_count(&self) -> u64 {
        self.drops.load(Ordering::Relaxed)
    }

    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// The connection's own bookkeeping of joined rooms. Mutated only by
    /// the registry's join/leave operations.
    pub fn rooms(&self) -> Vec<String> {
        self.rooms
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    pub fn in_room(&self, room: &str) -> bool {
        self.rooms
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(room)
    }

    pub(super) fn add_room(&self, room: &str) {
        self.rooms
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(room.to_string());
    }

    pub(super) fn remove_room(&self, room: &str) -> bool {
        self.rooms
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(room)
    }

    pub(super) fn take_rooms(&self) -> Vec<String> {
        self.rooms
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .drain()
            .collect()
    }
}
