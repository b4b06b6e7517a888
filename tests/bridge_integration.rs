//! Live Bridge round-trips over a Unix domain socket.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use wire_broker::bridge::{
    read_frame, write_frame, BridgeOp, BridgeOutcome, BridgeRequest, BridgeResponse, BridgeServer,
    DEFAULT_MAX_FRAME_BYTES,
};
use wire_broker::channel::{ChannelSet, MESSAGE_CHANNEL};
use wire_broker::config::{AuthConfig, BridgeConfig, StatsConfig, TierLimits, WebSocketConfig};
use wire_broker::connection::ConnectionManager;
use wire_broker::ratelimit::RateLimiter;
use wire_broker::shutdown::Lifecycle;
use wire_broker::stats::{BandwidthCounters, StatsAggregator};
use wire_broker::tier::{JwtCredentialIssuer, TierResolver};
use wire_broker::websocket::{OutboundMessage, ServerMessage};

struct BridgeHarness {
    manager: Arc<ConnectionManager>,
    channels: Arc<ChannelSet>,
    lifecycle: Arc<Lifecycle>,
    shutdown_tx: broadcast::Sender<()>,
    socket_path: std::path::PathBuf,
}

async fn start_bridge() -> BridgeHarness {
    let auth = AuthConfig::default();
    let channels = Arc::new(ChannelSet::new());
    let issuer = Arc::new(JwtCredentialIssuer::new(&auth));
    let resolver = Arc::new(TierResolver::new(&auth, issuer));
    let limiter = Arc::new(RateLimiter::new(
        TierLimits::default(),
        Duration::from_secs(60),
    ));
    let manager = Arc::new(ConnectionManager::new(
        WebSocketConfig::default(),
        channels.clone(),
        resolver,
        limiter.clone(),
    ));
    let aggregator = Arc::new(StatsAggregator::new(
        &StatsConfig::default(),
        manager.clone(),
        channels.clone(),
        limiter,
        Arc::new(BandwidthCounters::new()),
    ));
    let lifecycle = Arc::new(Lifecycle::new(manager.clone()));

    let socket_path =
        std::env::temp_dir().join(format!("wire-broker-test-{}.sock", Uuid::new_v4()));
    let config = BridgeConfig {
        socket_path: socket_path.to_string_lossy().into_owned(),
        ..Default::default()
    };

    let server = Arc::new(BridgeServer::new(
        &config,
        manager.clone(),
        lifecycle.clone(),
        aggregator,
    ));
    let shutdown_tx = lifecycle.shutdown_sender();
    let shutdown_rx = shutdown_tx.subscribe();
    tokio::spawn(async move {
        let _ = server.run(shutdown_rx).await;
    });

    // Wait for the listener to come up.
    for _ in 0..50 {
        if socket_path.exists() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    BridgeHarness {
        manager,
        channels,
        lifecycle,
        shutdown_tx,
        socket_path,
    }
}

async fn call(stream: &mut UnixStream, op: BridgeOp) -> BridgeResponse {
    let request = BridgeRequest {
        id: Uuid::new_v4(),
        op,
    };
    write_frame(stream, &request, DEFAULT_MAX_FRAME_BYTES)
        .await
        .unwrap();
    let response: BridgeResponse = read_frame(stream, DEFAULT_MAX_FRAME_BYTES)
        .await
        .unwrap()
        .expect("bridge closed the stream");
    assert_eq!(response.id, request.id, "correlation id must be echoed");
    response
}

#[tokio::test]
async fn test_bridge_broadcast_injects_system_message() {
    let harness = start_bridge().await;

    // One live subscriber on the message channel.
    let (tx, mut rx) = mpsc::channel::<OutboundMessage>(8);
    let conn = harness.manager.connect(None, tx).await.unwrap();
    harness.manager.subscribe(conn.id, MESSAGE_CHANNEL).unwrap();

    let mut stream = UnixStream::connect(&harness.socket_path).await.unwrap();
    let response = call(
        &mut stream,
        BridgeOp::Broadcast {
            channel: MESSAGE_CHANNEL.to_string(),
            payload: json!("maintenance at noon"),
        },
    )
    .await;

    match response.outcome {
        BridgeOutcome::Ok { data } => assert_eq!(data["delivered"], 1),
        BridgeOutcome::Error { error, code } => panic!("bridge error {code}: {error}"),
    }

    let delivered = rx.try_recv().unwrap();
    let message: ServerMessage = serde_json::from_str(&delivered.to_json().unwrap()).unwrap();
    match message {
        ServerMessage::Message { data, user, .. } => {
            assert_eq!(data, json!("maintenance at noon"));
            assert_eq!(user.as_deref(), Some("system"));
        }
        other => panic!("unexpected message: {other:?}"),
    }

    let _ = harness.shutdown_tx.send(());
}

#[tokio::test]
async fn test_bridge_broadcast_to_unknown_channel_fails_with_code() {
    let harness = start_bridge().await;

    let mut stream = UnixStream::connect(&harness.socket_path).await.unwrap();
    let response = call(
        &mut stream,
        BridgeOp::Broadcast {
            channel: "nonexistent".to_string(),
            payload: json!("x"),
        },
    )
    .await;

    match response.outcome {
        BridgeOutcome::Error { code, .. } => assert_eq!(code, "UNKNOWN_CHANNEL"),
        BridgeOutcome::Ok { .. } => panic!("expected an error"),
    }

    let _ = harness.shutdown_tx.send(());
}

#[tokio::test]
async fn test_bridge_lifecycle_operations() {
    let harness = start_bridge().await;

    // A live connection that should survive status queries but not `stop`.
    let (tx, mut rx) = mpsc::channel::<OutboundMessage>(8);
    let conn = harness.manager.connect(None, tx).await.unwrap();

    let mut stream = UnixStream::connect(&harness.socket_path).await.unwrap();

    let response = call(&mut stream, BridgeOp::GetStatus).await;
    match response.outcome {
        BridgeOutcome::Ok { data } => {
            assert_eq!(data["state"], "running");
            assert_eq!(data["connections"], 1);
        }
        BridgeOutcome::Error { error, code } => panic!("bridge error {code}: {error}"),
    }

    let response = call(&mut stream, BridgeOp::Stop).await;
    match response.outcome {
        BridgeOutcome::Ok { data } => assert_eq!(data["state"], "stopped"),
        BridgeOutcome::Error { error, code } => panic!("bridge error {code}: {error}"),
    }
    assert!(!harness.lifecycle.is_accepting());
    assert_eq!(harness.manager.connection_count(), 0);
    assert!(harness.manager.get(conn.id).is_none());

    // The dropped client was told to reconnect later.
    let mut saw_shutdown = false;
    while let Ok(msg) = rx.try_recv() {
        let message: ServerMessage = serde_json::from_str(&msg.to_json().unwrap()).unwrap();
        if matches!(message, ServerMessage::Shutdown { .. }) {
            saw_shutdown = true;
        }
    }
    assert!(saw_shutdown, "client should receive a shutdown notice");

    let response = call(&mut stream, BridgeOp::Start).await;
    match response.outcome {
        BridgeOutcome::Ok { data } => assert_eq!(data["state"], "running"),
        BridgeOutcome::Error { error, code } => panic!("bridge error {code}: {error}"),
    }
    assert!(harness.lifecycle.is_accepting());

    let response = call(&mut stream, BridgeOp::Restart).await;
    match response.outcome {
        BridgeOutcome::Ok { data } => assert_eq!(data["state"], "running"),
        BridgeOutcome::Error { error, code } => panic!("bridge error {code}: {error}"),
    }

    let _ = harness.shutdown_tx.send(());
    let _ = harness.channels;
}
