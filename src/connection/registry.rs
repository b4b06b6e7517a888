use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::channel::{Channel, ChannelSet, EventOrigin, ADMIN_CHANNEL, PRESENCE_CHANNEL};
use crate::config::WebSocketConfig;
use crate::error::BrokerError;
use crate::ratelimit::{RateLimitDecision, RateLimiter};
use crate::tier::{Capability, TierResolver};
use crate::websocket::{OutboundMessage, ServerMessage};

use super::ConnectionHandle;

/// Every connection lands here on connect.
pub const DEFAULT_ROOM: &str = "general";

/// Fan-out serializes the payload once above this recipient count.
const PRESERIALIZATION_THRESHOLD: usize = 4;

/// Outcome of a broadcast fan-out.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct BroadcastOutcome {
    pub delivered: usize,
    pub dropped: usize,
}

/// Observer for connection lifecycle, consumed by the Bridge for outward
/// `connection.opened` / `connection.closed` audit notifications.
pub trait ConnectionObserver: Send + Sync {
    fn connection_opened(&self, handle: &ConnectionHandle);
    fn connection_closed(&self, handle: &ConnectionHandle);
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionDetail {
    pub id: Uuid,
    pub identity: Option<String>,
    pub tier: crate::tier::Tier,
    pub rooms: Vec<String>,
    pub connected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionManagerStats {
    pub total_connections: usize,
    pub rooms: HashMap<String, usize>,
    pub connections: Vec<ConnectionDetail>,
}

/// Owns the connection registry and room membership.
///
/// All shared maps are sharded (`DashMap`); there is no global lock.
/// `join_room`/`leave_room` are the only mutators of both the room index
/// and a connection's own room set, keeping the two views consistent.
pub struct ConnectionManager {
    connections: DashMap<Uuid, Arc<ConnectionHandle>>,
    /// identity -> connection ids (an identity may have several devices)
    identity_index: DashMap<String, HashSet<Uuid>>,
    /// room name -> member connection ids
    rooms: DashMap<String, HashSet<Uuid>>,
    channels: Arc<ChannelSet>,
    resolver: Arc<TierResolver>,
    limiter: Arc<RateLimiter>,
    config: WebSocketConfig,
    observer: RwLock<Option<Arc<dyn ConnectionObserver>>>,
}

impl ConnectionManager {
    pub fn new(
        config: WebSocketConfig,
        channels: Arc<ChannelSet>,
        resolver: Arc<TierResolver>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        Self {
            connections: DashMap::new(),
            identity_index: DashMap::new(),
            rooms: DashMap::new(),
            channels,
            resolver,
            limiter,
            config,
            observer: RwLock::new(None),
        }
    }

    /// Attach the lifecycle observer (the Bridge notifier).
    pub fn set_observer(&self, observer: Arc<dyn ConnectionObserver>) {
        *self
            .observer
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(observer);
    }

    fn observer(&self) -> Option<Arc<dyn ConnectionObserver>> {
        self.observer
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    pub fn channels(&self) -> &Arc<ChannelSet> {
        &self.channels
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Handshake: resolve the credential, enforce admission limits,
    /// register the connection, join its default rooms, announce presence.
    ///
    /// Only a structurally malformed credential rejects the handshake; an
    /// unverifiable one admits the connection at `free`.
    pub async fn connect(
        &self,
        credential: Option<&str>,
        sender: mpsc::Sender<OutboundMessage>,
    ) -> Result<Arc<ConnectionHandle>, BrokerError> {
        let resolution = self.resolver.resolve(credential).await?;

        if self.connections.len() >= self.config.max_connections {
            return Err(BrokerError::ConnectionLimit(format!(
                "broker at capacity ({})",
                self.config.max_connections
            )));
        }

        if let Some(identity) = &resolution.identity {
            let existing = self
                .identity_index
                .get(identity)
                .map(|ids| ids.len())
                .unwrap_or(0);
            if existing >= self.config.max_connections_per_identity {
                return Err(BrokerError::ConnectionLimit(format!(
                    "identity {} at connection limit ({})",
                    identity, self.config.max_connections_per_identity
                )));
            }
        }

        let handle = Arc::new(ConnectionHandle::new(
            resolution.identity.clone(),
            resolution.tier,
            resolution.capabilities,
            sender,
        ));
        let connection_id = handle.id;

        self.connections.insert(connection_id, handle.clone());
        if let Some(identity) = &handle.identity {
            self.identity_index
                .entry(identity.clone())
                .or_default()
                .insert(connection_id);
        }

        self.join_room(connection_id, DEFAULT_ROOM);
        if let Some(identity) = handle.identity.clone() {
            self.join_room(connection_id, &format!("user:{identity}"));
            self.emit_presence("join", &identity);
        }

        if let Some(observer) = self.observer() {
            observer.connection_opened(&handle);
        }

        crate::metrics::CONNECTIONS_OPENED.inc();
        crate::metrics::CONNECTIONS_ACTIVE.set(self.connections.len() as i64);

        tracing::info!(
            connection_id = %connection_id,
            identity = handle.identity.as_deref().unwrap_or("anonymous"),
            tier = %handle.tier,
            "Connection registered"
        );

        Ok(handle)
    }

    /// Tear down a connection and every piece of derived state in one
    /// synchronous step: rooms, channel subscriber sets, identity index.
    /// Idempotent: a second call for the same id is a no-op.
    pub fn disconnect(&self, connection_id: Uuid) -> bool {
        let Some((_, handle)) = self.connections.remove(&connection_id) else {
            return false;
        };

        if let Some(identity) = &handle.identity {
            if let Some(mut ids) = self.identity_index.get_mut(identity) {
                ids.remove(&connection_id);
                if ids.is_empty() {
                    drop(ids);
                    self.identity_index.remove(identity);
                }
            }
        }

        for room in handle.take_rooms() {
            self.remove_from_room_index(connection_id, &room);
        }

        self.channels.unsubscribe_all(connection_id);

        if let Some(identity) = handle.identity.clone() {
            self.emit_presence("leave", &identity);
        }

        if let Some(observer) = self.observer() {
            observer.connection_closed(&handle);
        }

        crate::metrics::CONNECTIONS_CLOSED.inc();
        crate::metrics::CONNECTIONS_ACTIVE.set(self.connections.len() as i64);

        tracing::info!(
            connection_id = %connection_id,
            identity = handle.identity.as_deref().unwrap_or("anonymous"),
            "Connection unregistered"
        );

        true
    }

    /// Idempotently add a connection to a room. `false` if the connection
    /// is unknown or the room name is invalid.
    pub fn join_room(&self, connection_id: Uuid, room: &str) -> bool {
        if !is_valid_name(room) {
            return false;
        }
        let Some(handle) = self.connections.get(&connection_id).map(|h| h.clone()) else {
            return false;
        };

        // Room index first, then the connection's own view, always in this
        // order: these two writes are the single mutation point for both
        // sides of the membership invariant.
        self.rooms
            .entry(room.to_string())
            .or_default()
            .insert(connection_id);
        handle.add_room(room);

        // A disconnect may have raced between the registry lookup and the
        // membership writes; membership must stay a subset of live
        // connections, so undo both sides if the connection is gone.
        if !self.connections.contains_key(&connection_id) {
            handle.remove_room(room);
            self.remove_from_room_index(connection_id, room);
            return false;
        }

        tracing::debug!(connection_id = %connection_id, room = %room, "Joined room");
        true
    }

    /// Idempotently remove a connection from a room; the room record is
    /// deleted the moment its membership reaches zero.
    pub fn leave_room(&self, connection_id: Uuid, room: &str) -> bool {
        let Some(handle) = self.connections.get(&connection_id).map(|h| h.clone()) else {
            return false;
        };
        let was_member = handle.remove_room(room);
        if was_member {
            self.remove_from_room_index(connection_id, room);
            tracing::debug!(connection_id = %connection_id, room = %room, "Left room");
        }
        was_member
    }

    fn remove_from_room_index(&self, connection_id: Uuid, room: &str) {
        if let Some(mut members) = self.rooms.get_mut(room) {
            members.remove(&connection_id);
            if members.is_empty() {
                drop(members);
                self.rooms.remove(room);
            }
        }
    }

    /// Subscribe a connection to a named channel. The admin channel is
    /// visible only to admin-tier connections.
    pub fn subscribe(&self, connection_id: Uuid, channel_name: &str) -> Result<(), BrokerError> {
        let handle = self
            .connections
            .get(&connection_id)
            .ok_or_else(|| BrokerError::InvalidEvent("unknown connection".to_string()))?;

        if !handle.has_capability(Capability::Subscribe) {
            return Err(BrokerError::Forbidden(
                "tier lacks subscribe capability".to_string(),
            ));
        }
        if channel_name == ADMIN_CHANNEL && !handle.has_capability(Capability::Admin) {
            return Err(BrokerError::Forbidden(
                "admin channel requires admin capability".to_string(),
            ));
        }

        let channel = self
            .channels
            .get(channel_name)
            .ok_or_else(|| BrokerError::UnknownChannel(channel_name.to_string()))?;
        channel.subscribe(connection_id);
        Ok(())
    }

    pub fn unsubscribe(&self, connection_id: Uuid, channel_name: &str) -> Result<(), BrokerError> {
        let channel = self
            .channels
            .get(channel_name)
            .ok_or_else(|| BrokerError::UnknownChannel(channel_name.to_string()))?;
        channel.unsubscribe(connection_id);
        Ok(())
    }

    /// The per-event hot path: tier lookup, rate limit, channel dispatch,
    /// broadcast. Errors are returned to the caller for acknowledgment to
    /// the originating connection only, never broadcast.
    pub fn route_event(
        &self,
        connection_id: Uuid,
        channel_name: &str,
        event: &serde_json::Value,
    ) -> Result<BroadcastOutcome, BrokerError> {
        let handle = self
            .connections
            .get(&connection_id)
            .ok_or_else(|| BrokerError::InvalidEvent("unknown connection".to_string()))?
            .clone();

        if !handle.has_capability(Capability::Publish) {
            return Err(BrokerError::Forbidden(
                "tier lacks publish capability".to_string(),
            ));
        }

        match self.limiter.check(&handle.rate_key(), handle.tier) {
            RateLimitDecision::Allowed => {}
            RateLimitDecision::Limited { retry_after_secs } => {
                return Err(BrokerError::RateLimitExceeded { retry_after_secs });
            }
        }

        let channel = self
            .channels
            .get(channel_name)
            .ok_or_else(|| BrokerError::UnknownChannel(channel_name.to_string()))?;

        let message = channel.process(&handle.origin(), event)?;
        Ok(self.broadcast(channel, &message))
    }

    /// Inject an event as the system (Bridge `broadcast` operation).
    /// Bypasses rate limiting; the Control Plane is trusted.
    pub fn inject(
        &self,
        channel_name: &str,
        event: &serde_json::Value,
    ) -> Result<BroadcastOutcome, BrokerError> {
        let channel = self
            .channels
            .get(channel_name)
            .ok_or_else(|| BrokerError::UnknownChannel(channel_name.to_string()))?;
        let message = channel.process(&EventOrigin::system(), event)?;
        Ok(self.broadcast(channel, &message))
    }

    /// Fan a payload out to every subscriber of a channel. Fire-and-forget
    /// per subscriber: a full outbound queue drops the send, and a consumer
    /// that exhausts its drop budget is disconnected instead of stalling
    /// everyone else.
    pub fn broadcast(&self, channel: &Arc<Channel>, message: &ServerMessage) -> BroadcastOutcome {
        self.fan_out(&channel.subscribers(), message)
    }

    /// Fan a payload out to every member of a room.
    pub fn broadcast_to_room(&self, room: &str, message: &ServerMessage) -> BroadcastOutcome {
        let members: Vec<Uuid> = self
            .rooms
            .get(room)
            .map(|m| m.iter().copied().collect())
            .unwrap_or_default();
        self.fan_out(&members, message)
    }

    fn fan_out(&self, recipients: &[Uuid], message: &ServerMessage) -> BroadcastOutcome {
        if recipients.is_empty() {
            return BroadcastOutcome::default();
        }

        let outbound = if recipients.len() >= PRESERIALIZATION_THRESHOLD {
            match OutboundMessage::preserialized(message) {
                Ok(msg) => msg,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to pre-serialize broadcast payload");
                    OutboundMessage::Raw(message.clone())
                }
            }
        } else {
            OutboundMessage::Raw(message.clone())
        };

        let mut outcome = BroadcastOutcome::default();
        let mut to_disconnect = Vec::new();

        for id in recipients {
            let Some(handle) = self.connections.get(id).map(|h| h.clone()) else {
                continue;
            };
            if handle.try_send(outbound.clone()) {
                outcome.delivered += 1;
            } else {
                outcome.dropped += 1;
                if handle.is_closed() || handle.drop_count() >= self.config.max_send_drops {
                    to_disconnect.push(*id);
                }
            }
        }

        for id in to_disconnect {
            tracing::warn!(connection_id = %id, "Disconnecting slow or dead consumer");
            self.disconnect(id);
        }

        outcome
    }

    /// Process and broadcast a system presence event. Connect/disconnect
    /// bookkeeping and not rate limited.
    fn emit_presence(&self, action: &str, identity: &str) {
        let Some(presence) = self.channels.get(PRESENCE_CHANNEL) else {
            return;
        };
        let event = json!({"action": action, "user": identity});
        match presence.process(&EventOrigin::system(), &event) {
            Ok(message) => {
                self.broadcast(presence, &message);
            }
            Err(e) => {
                tracing::error!(error = %e, action = %action, "Presence emission failed");
            }
        }
    }

    pub fn get(&self, connection_id: Uuid) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&connection_id).map(|h| h.clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    pub fn room_members(&self, room: &str) -> usize {
        self.rooms.get(room).map(|m| m.len()).unwrap_or(0)
    }

    pub fn all_connections(&self) -> Vec<Arc<ConnectionHandle>> {
        self.connections.iter().map(|r| r.value().clone()).collect()
    }

    pub fn stats(&self) -> ConnectionManagerStats {
        let rooms = self
            .rooms
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().len()))
            .collect();

        let connections = self
            .connections
            .iter()
            .map(|entry| {
                let handle = entry.value();
                ConnectionDetail {
                    id: handle.id,
                    identity: handle.identity.clone(),
                    tier: handle.tier,
                    rooms: handle.rooms(),
                    connected_at: handle.connected_at,
                }
            })
            .collect();

        ConnectionManagerStats {
            total_connections: self.connections.len(),
            rooms,
            connections,
        }
    }

    /// Connections with no activity for longer than `timeout_secs`.
    pub fn find_stale(&self, timeout_secs: u64) -> Vec<Uuid> {
        let now = Utc::now();
        let timeout = chrono::Duration::seconds(timeout_secs as i64);
        self.connections
            .iter()
            .filter(|entry| now.signed_duration_since(entry.value().last_activity()) > timeout)
            .map(|entry| *entry.key())
            .collect()
    }

    /// Disconnect stale connections; returns how many were removed.
    pub fn cleanup_stale(&self, timeout_secs: u64) -> usize {
        let stale = self.find_stale(timeout_secs);
        let count = stale.len();
        for connection_id in stale {
            tracing::info!(connection_id = %connection_id, "Removing stale connection");
            self.disconnect(connection_id);
        }
        count
    }
}

/// Room and channel names: short, no separators beyond `-`, `_`, `.`, `:`.
pub(crate) fn is_valid_name(name: &str) -> bool {
    if name.is_empty() || name.len() > 64 {
        return false;
    }
    name.chars()
        .all(|c| c.is_alphanumeric() || c == '-' || c == '_' || c == '.' || c == ':')
}
