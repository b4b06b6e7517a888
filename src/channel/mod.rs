//! Pub/sub channels: a closed set of typed event categories.
//!
//! A channel is distinct from a room: rooms group connections, channels
//! process typed events and keep their own counters. The set is closed by
//! design: new channel types are added by extending [`ChannelBehavior`],
//! not by runtime lookup.

mod message;
mod presence;
mod status;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::BrokerError;
use crate::tier::Tier;
use crate::websocket::ServerMessage;

pub const MESSAGE_CHANNEL: &str = "message";
pub const PRESENCE_CHANNEL: &str = "presence";
pub const STATUS_CHANNEL: &str = "status";
/// Reserved stats stream, visible only to admin-tier subscribers.
pub const ADMIN_CHANNEL: &str = "admin";

/// Where an event came from: a live connection or the system itself
/// (Bridge injections, connect/disconnect bookkeeping).
#[derive(Debug, Clone)]
pub struct EventOrigin {
    pub connection_id: Option<Uuid>,
    pub identity: Option<String>,
    pub tier: Tier,
}

impl EventOrigin {
    pub fn system() -> Self {
        Self {
            connection_id: None,
            identity: Some("system".to_string()),
            tier: Tier::Admin,
        }
    }

    pub fn connection(connection_id: Uuid, identity: Option<String>, tier: Tier) -> Self {
        Self {
            connection_id: Some(connection_id),
            identity,
            tier,
        }
    }
}

/// Counters reported by `stats()`. Monotonic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChannelStats {
    pub messages_processed: u64,
    pub subscribers: usize,
    pub errors: u64,
}

enum ChannelBehavior {
    Message,
    Presence {
        /// Active-user registry, distinct from the subscriber set.
        active: RwLock<HashMap<String, DateTime<Utc>>>,
    },
    Status,
    /// Accepts no client events; fed by the stats aggregator.
    Admin,
}

/// One pub/sub unit. Subscription is idempotent both ways; `process`
/// validates and applies the channel's domain logic, returning the payload
/// to broadcast.
pub struct Channel {
    name: &'static str,
    behavior: ChannelBehavior,
    subscribers: RwLock<HashSet<Uuid>>,
    messages_processed: AtomicU64,
    errors: AtomicU64,
}

impl Channel {
    fn new(name: &'static str, behavior: ChannelBehavior) -> Self {
        Self {
            name,
            behavior,
            subscribers: RwLock::new(HashSet::new()),
            messages_processed: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Idempotent add; returns whether the connection was newly added.
    pub fn subscribe(&self, connection_id: Uuid) -> bool {
        self.subscribers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .insert(connection_id)
    }

    /// Idempotent remove; returns whether the connection was present.
    pub fn unsubscribe(&self, connection_id: Uuid) -> bool {
        self.subscribers
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .remove(&connection_id)
    }

    pub fn is_subscribed(&self, connection_id: Uuid) -> bool {
        self.subscribers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .contains(&connection_id)
    }

    /// Snapshot of the current subscriber set.
    pub fn subscribers(&self) -> Vec<Uuid> {
        self.subscribers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .iter()
            .copied()
            .collect()
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    /// Validate and apply an event. Success increments
    /// `messages_processed` and yields a broadcastable payload; validation
    /// failure increments `errors` and leaves `messages_processed` alone.
    pub fn process(&self, origin: &EventOrigin, event: &Value) -> Result<ServerMessage, BrokerError> {
        let result = match &self.behavior {
            ChannelBehavior::Message => message::process(origin, event),
            ChannelBehavior::Presence { active } => presence::process(active, event),
            ChannelBehavior::Status => status::process(origin, event),
            ChannelBehavior::Admin => Err(BrokerError::InvalidEvent(
                "admin channel does not accept client events".to_string(),
            )),
        };

        match result {
            Ok(message) => {
                self.messages_processed.fetch_add(1, Ordering::Relaxed);
                crate::metrics::EVENTS_PROCESSED
                    .with_label_values(&[self.name])
                    .inc();
                Ok(message)
            }
            Err(e) => {
                self.errors.fetch_add(1, Ordering::Relaxed);
                crate::metrics::EVENTS_REJECTED
                    .with_label_values(&[self.name])
                    .inc();
                Err(e)
            }
        }
    }

    pub fn stats(&self) -> ChannelStats {
        ChannelStats {
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            subscribers: self.subscriber_count(),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }

    /// Current presence registry, oldest join first. Empty for channels
    /// without one.
    pub fn active_users(&self) -> Vec<String> {
        match &self.behavior {
            ChannelBehavior::Presence { active } => {
                let registry = active
                    .read()
                    .unwrap_or_else(std::sync::PoisonError::into_inner);
                let mut users: Vec<_> = registry.iter().collect();
                users.sort_by_key(|(_, joined_at)| **joined_at);
                users.into_iter().map(|(user, _)| user.clone()).collect()
            }
            _ => Vec::new(),
        }
    }
}

/// The fixed channel set, built once at startup and shared by handle.
pub struct ChannelSet {
    channels: Vec<std::sync::Arc<Channel>>,
}

impl ChannelSet {
    pub fn new() -> Self {
        Self {
            channels: vec![
                std::sync::Arc::new(Channel::new(MESSAGE_CHANNEL, ChannelBehavior::Message)),
                std::sync::Arc::new(Channel::new(
                    PRESENCE_CHANNEL,
                    ChannelBehavior::Presence {
                        active: RwLock::new(HashMap::new()),
                    },
                )),
                std::sync::Arc::new(Channel::new(STATUS_CHANNEL, ChannelBehavior::Status)),
                std::sync::Arc::new(Channel::new(ADMIN_CHANNEL, ChannelBehavior::Admin)),
            ],
        }
    }

    pub fn get(&self, name: &str) -> Option<&std::sync::Arc<Channel>> {
        self.channels.iter().find(|c| c.name() == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &std::sync::Arc<Channel>> {
        self.channels.iter()
    }

    /// Drop a connection from every subscriber set.
    pub fn unsubscribe_all(&self, connection_id: Uuid) {
        for channel in &self.channels {
            channel.unsubscribe(connection_id);
        }
    }

    pub fn stats(&self) -> HashMap<String, ChannelStats> {
        self.channels
            .iter()
            .map(|c| (c.name().to_string(), c.stats()))
            .collect()
    }
}

impl Default for ChannelSet {
    fn default() -> Self {
        Self::new()
    }
}
