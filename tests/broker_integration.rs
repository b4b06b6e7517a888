//! Cross-component integration tests.
//!
//! These wire the broker components together directly, with mpsc capture
//! channels standing in for live WebSocket connections, no server startup
//! required.

use std::sync::Arc;
use std::time::Duration;

use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::json;
use tokio::sync::mpsc;

use wire_broker::channel::{ChannelSet, ADMIN_CHANNEL, MESSAGE_CHANNEL, PRESENCE_CHANNEL};
use wire_broker::config::{
    ApiKeyConfig, AuthConfig, StatsConfig, TierLimits, WebSocketConfig,
};
use wire_broker::connection::{ConnectionHandle, ConnectionManager, DEFAULT_ROOM};
use wire_broker::error::BrokerError;
use wire_broker::ratelimit::RateLimiter;
use wire_broker::stats::{BandwidthCounters, StatsAggregator};
use wire_broker::tier::{JwtCredentialIssuer, Tier, TierResolver, TokenClaims};
use wire_broker::websocket::{OutboundMessage, ServerMessage};

const ADMIN_SECRET: &str = "test-admin-secret";

struct TestBroker {
    channels: Arc<ChannelSet>,
    manager: Arc<ConnectionManager>,
    limiter: Arc<RateLimiter>,
    bandwidth: Arc<BandwidthCounters>,
}

fn auth_config() -> AuthConfig {
    AuthConfig {
        admin_secret: ADMIN_SECRET.to_string(),
        federation_secret: None,
        issuer: None,
        audience: None,
        api_keys: vec![ApiKeyConfig {
            key: "key-reporting".to_string(),
            tier: Tier::Wire,
            identity: "svc-reporting".to_string(),
        }],
        cache_ttl_seconds: 60,
    }
}

fn create_broker(websocket: WebSocketConfig) -> TestBroker {
    let auth = auth_config();
    let channels = Arc::new(ChannelSet::new());
    let issuer = Arc::new(JwtCredentialIssuer::new(&auth));
    let resolver = Arc::new(TierResolver::new(&auth, issuer));
    let limiter = Arc::new(RateLimiter::new(
        TierLimits::default(),
        Duration::from_secs(60),
    ));
    let manager = Arc::new(ConnectionManager::new(
        websocket,
        channels.clone(),
        resolver,
        limiter.clone(),
    ));

    TestBroker {
        channels,
        manager,
        limiter,
        bandwidth: Arc::new(BandwidthCounters::new()),
    }
}

fn admin_token() -> String {
    let claims = TokenClaims {
        sub: "ops-1".to_string(),
        exp: chrono::Utc::now().timestamp() + 3600,
        iat: chrono::Utc::now().timestamp(),
        roles: vec!["admin".to_string()],
        tier: None,
        extra: Default::default(),
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(ADMIN_SECRET.as_bytes()),
    )
    .unwrap()
}

async fn connect(
    broker: &TestBroker,
    credential: Option<&str>,
) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
    let (tx, rx) = mpsc::channel(32);
    let handle = broker.manager.connect(credential, tx).await.unwrap();
    (handle, rx)
}

fn drain(rx: &mut mpsc::Receiver<OutboundMessage>) -> Vec<ServerMessage> {
    let mut messages = Vec::new();
    while let Ok(msg) = rx.try_recv() {
        let json = msg.to_json().unwrap();
        messages.push(serde_json::from_str(&json).unwrap());
    }
    messages
}

#[tokio::test]
async fn test_free_tier_rate_limit_end_to_end() {
    let broker = create_broker(WebSocketConfig::default());
    let (conn, _rx) = connect(&broker, None).await;
    assert_eq!(conn.tier, Tier::Free);

    // All ten messages within the window succeed.
    for i in 0..10 {
        let outcome = broker
            .manager
            .route_event(conn.id, MESSAGE_CHANNEL, &json!(format!("msg {i}")));
        assert!(outcome.is_ok(), "message {i} should be allowed");
    }

    // The eleventh is rejected with RATE_LIMIT_EXCEEDED and does not reach
    // the channel.
    let err = broker
        .manager
        .route_event(conn.id, MESSAGE_CHANNEL, &json!("one too many"))
        .unwrap_err();
    assert!(matches!(err, BrokerError::RateLimitExceeded { .. }));

    let stats = broker.channels.get(MESSAGE_CHANNEL).unwrap().stats();
    assert_eq!(stats.messages_processed, 10);
    assert_eq!(stats.errors, 0);
}

#[tokio::test]
async fn test_wire_tier_budget_from_api_key_metadata() {
    let broker = create_broker(WebSocketConfig::default());
    let (conn, _rx) = connect(&broker, Some("key-reporting")).await;
    assert_eq!(conn.tier, Tier::Wire);
    assert_eq!(conn.identity.as_deref(), Some("svc-reporting"));

    for _ in 0..100 {
        assert!(broker.limiter.check(&conn.rate_key(), conn.tier).is_allowed());
    }
    assert!(!broker.limiter.check(&conn.rate_key(), conn.tier).is_allowed());
}

#[tokio::test]
async fn test_disconnect_clears_every_index_and_is_idempotent() {
    let broker = create_broker(WebSocketConfig::default());
    let (conn, _rx) = connect(&broker, None).await;

    broker.manager.subscribe(conn.id, MESSAGE_CHANNEL).unwrap();
    broker.manager.subscribe(conn.id, PRESENCE_CHANNEL).unwrap();
    assert!(broker.manager.join_room(conn.id, "ops"));
    assert!(conn.in_room(DEFAULT_ROOM));

    assert!(broker.manager.disconnect(conn.id));

    assert!(broker.manager.get(conn.id).is_none());
    assert_eq!(broker.manager.room_members(DEFAULT_ROOM), 0);
    assert_eq!(broker.manager.room_members("ops"), 0);
    assert_eq!(broker.manager.room_count(), 0);
    for channel in broker.channels.iter() {
        assert!(!channel.is_subscribed(conn.id));
    }

    // Second disconnect is a no-op with the same end state.
    assert!(!broker.manager.disconnect(conn.id));
    assert_eq!(broker.manager.connection_count(), 0);
}

#[tokio::test]
async fn test_presence_join_leave_triggers_exactly_two_broadcasts() {
    let broker = create_broker(WebSocketConfig::default());

    let (watcher, mut watcher_rx) = connect(&broker, None).await;
    broker.manager.subscribe(watcher.id, PRESENCE_CHANNEL).unwrap();

    let (actor, _actor_rx) = connect(&broker, None).await;
    broker
        .manager
        .route_event(actor.id, PRESENCE_CHANNEL, &json!({"action": "join", "user": "carol"}))
        .unwrap();
    broker
        .manager
        .route_event(actor.id, PRESENCE_CHANNEL, &json!({"action": "leave", "user": "carol"}))
        .unwrap();

    let updates: Vec<ServerMessage> = drain(&mut watcher_rx)
        .into_iter()
        .filter(|m| matches!(m, ServerMessage::PresenceUpdate { .. }))
        .collect();
    assert_eq!(updates.len(), 2);

    match &updates[0] {
        ServerMessage::PresenceUpdate { users, .. } => {
            assert_eq!(users.len(), 1);
            assert_eq!(users[0].user, "carol");
        }
        other => panic!("unexpected message: {other:?}"),
    }
    match &updates[1] {
        ServerMessage::PresenceUpdate { users, .. } => assert!(users.is_empty()),
        other => panic!("unexpected message: {other:?}"),
    }
    assert!(broker
        .channels
        .get(PRESENCE_CHANNEL)
        .unwrap()
        .active_users()
        .is_empty());
}

#[tokio::test]
async fn test_room_broadcast_after_disconnect_reaches_survivor_only() {
    let broker = create_broker(WebSocketConfig::default());

    let (conn_a, mut rx_a) = connect(&broker, None).await;
    let (conn_b, mut rx_b) = connect(&broker, None).await;
    assert_eq!(broker.manager.room_members(DEFAULT_ROOM), 2);

    broker.manager.disconnect(conn_a.id);
    assert_eq!(broker.manager.room_members(DEFAULT_ROOM), 1);

    let notice = ServerMessage::Message {
        data: json!("hello room"),
        user: None,
        timestamp: 0,
    };
    let outcome = broker.manager.broadcast_to_room(DEFAULT_ROOM, &notice);
    assert_eq!(outcome.delivered, 1);

    assert!(drain(&mut rx_a).is_empty());
    let received = drain(&mut rx_b);
    assert_eq!(received.len(), 1);
    assert!(matches!(received[0], ServerMessage::Message { .. }));
    let _ = conn_b;
}

#[tokio::test]
async fn test_malformed_credential_rejects_but_unverifiable_admits() {
    let broker = create_broker(WebSocketConfig::default());

    // Structurally invalid: embedded control character.
    let (tx, _rx) = mpsc::channel(8);
    let err = broker
        .manager
        .connect(Some("bad\x07credential"), tx)
        .await
        .unwrap_err();
    assert!(matches!(err, BrokerError::CredentialMalformed(_)));
    assert_eq!(broker.manager.connection_count(), 0);

    // Well-formed but unverifiable: admitted at free.
    let (conn, _rx) = connect(&broker, Some("some-unknown-token")).await;
    assert_eq!(conn.tier, Tier::Free);
    assert_eq!(conn.identity, None);
}

#[tokio::test]
async fn test_admin_channel_visibility() {
    let broker = create_broker(WebSocketConfig::default());

    let (free_conn, _free_rx) = connect(&broker, None).await;
    let err = broker.manager.subscribe(free_conn.id, ADMIN_CHANNEL).unwrap_err();
    assert!(matches!(err, BrokerError::Forbidden(_)));

    let token = admin_token();
    let (admin_conn, _admin_rx) = connect(&broker, Some(&token)).await;
    assert_eq!(admin_conn.tier, Tier::Admin);
    broker.manager.subscribe(admin_conn.id, ADMIN_CHANNEL).unwrap();
}

#[tokio::test]
async fn test_stats_snapshot_matches_registry_between_ticks() {
    let broker = create_broker(WebSocketConfig::default());
    let aggregator = StatsAggregator::new(
        &StatsConfig {
            interval_ms: 2000,
            retention: 3,
        },
        broker.manager.clone(),
        broker.channels.clone(),
        broker.limiter.clone(),
        broker.bandwidth.clone(),
    );

    let (conn_a, _rx_a) = connect(&broker, None).await;
    let (_conn_b, _rx_b) = connect(&broker, None).await;
    let snapshot = aggregator.tick();
    assert_eq!(snapshot.total_connections, 2);

    broker.manager.disconnect(conn_a.id);
    let snapshot = aggregator.tick();
    assert_eq!(snapshot.total_connections, 1);

    // Retention is a bounded ring: oldest snapshots fall out.
    aggregator.tick();
    aggregator.tick();
    let recent = aggregator.recent(10);
    assert_eq!(recent.len(), 3);
    assert_eq!(recent.last().unwrap().total_connections, 1);
}

#[tokio::test]
async fn test_stats_update_reaches_admin_subscribers() {
    let broker = create_broker(WebSocketConfig::default());
    let aggregator = StatsAggregator::new(
        &StatsConfig::default(),
        broker.manager.clone(),
        broker.channels.clone(),
        broker.limiter.clone(),
        broker.bandwidth.clone(),
    );

    let token = admin_token();
    let (admin_conn, mut admin_rx) = connect(&broker, Some(&token)).await;
    broker.manager.subscribe(admin_conn.id, ADMIN_CHANNEL).unwrap();

    aggregator.tick();

    let received = drain(&mut admin_rx);
    let update = received
        .iter()
        .find(|m| matches!(m, ServerMessage::StatsUpdate { .. }));
    match update {
        Some(ServerMessage::StatsUpdate { snapshot }) => {
            assert_eq!(snapshot.total_connections, 1);
        }
        _ => panic!("admin subscriber did not receive a stats update"),
    }
}

#[tokio::test]
async fn test_empty_message_is_acknowledged_not_broadcast() {
    let broker = create_broker(WebSocketConfig::default());

    let (listener, mut listener_rx) = connect(&broker, None).await;
    broker.manager.subscribe(listener.id, MESSAGE_CHANNEL).unwrap();

    let (sender, _sender_rx) = connect(&broker, None).await;
    let err = broker
        .manager
        .route_event(sender.id, MESSAGE_CHANNEL, &json!(""))
        .unwrap_err();
    assert!(matches!(err, BrokerError::InvalidEvent(_)));

    // The failure stayed local to the sender.
    assert!(drain(&mut listener_rx).is_empty());
    let stats = broker.channels.get(MESSAGE_CHANNEL).unwrap().stats();
    assert_eq!(stats.messages_processed, 0);
    assert_eq!(stats.errors, 1);
}

#[tokio::test]
async fn test_slow_consumer_is_disconnected_not_waited_on() {
    let broker = create_broker(WebSocketConfig {
        outbound_queue_size: 1,
        max_send_drops: 2,
        ..Default::default()
    });

    // A consumer with a single-slot queue that never drains it.
    let (tx, _slow_rx) = mpsc::channel(1);
    let slow = broker.manager.connect(None, tx).await.unwrap();
    broker.manager.subscribe(slow.id, MESSAGE_CHANNEL).unwrap();

    let channel = broker.channels.get(MESSAGE_CHANNEL).unwrap();
    let notice = ServerMessage::Message {
        data: json!("x"),
        user: None,
        timestamp: 0,
    };

    // First fill the queue, then burn through the drop budget.
    for _ in 0..4 {
        broker.manager.broadcast(channel, &notice);
    }

    assert!(broker.manager.get(slow.id).is_none());
    assert!(!channel.is_subscribed(slow.id));
}

#[tokio::test]
async fn test_unknown_channel_is_rejected() {
    let broker = create_broker(WebSocketConfig::default());
    let (conn, _rx) = connect(&broker, None).await;

    let err = broker
        .manager
        .route_event(conn.id, "presence2", &json!("x"))
        .unwrap_err();
    assert!(matches!(err, BrokerError::UnknownChannel(_)));
}

#[tokio::test]
async fn test_identified_connection_joins_user_room_and_announces() {
    let broker = create_broker(WebSocketConfig::default());

    let (watcher, mut watcher_rx) = connect(&broker, None).await;
    broker.manager.subscribe(watcher.id, PRESENCE_CHANNEL).unwrap();

    let (conn, _rx) = connect(&broker, Some("key-reporting")).await;
    assert!(conn.in_room("user:svc-reporting"));
    assert_eq!(broker.manager.room_members("user:svc-reporting"), 1);

    let joins: Vec<ServerMessage> = drain(&mut watcher_rx)
        .into_iter()
        .filter(|m| matches!(m, ServerMessage::PresenceUpdate { .. }))
        .collect();
    assert_eq!(joins.len(), 1);

    broker.manager.disconnect(conn.id);
    let leaves = drain(&mut watcher_rx);
    assert_eq!(leaves.len(), 1);
    assert_eq!(broker.manager.room_members("user:svc-reporting"), 0);
}
