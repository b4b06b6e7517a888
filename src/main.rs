use std::sync::Arc;

use anyhow::Result;
use tokio::net::TcpListener;
use tokio::signal;

use wire_broker::bridge::{notifier_pair, BridgeServer};
use wire_broker::config::Settings;
use wire_broker::server::{create_app, AppState};
use wire_broker::shutdown::Lifecycle;
use wire_broker::tasks::{HeartbeatTask, RateLimitCleanupTask};
use wire_broker::telemetry::init_telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let settings = Settings::new()?;

    // Initialize tracing (keep the guard for the process lifetime)
    let _telemetry = init_telemetry(&settings.otel)?;
    tracing::info!("Configuration loaded");

    // Create application state
    let state = AppState::new(settings.clone());
    tracing::info!("Application state initialized");

    // Outward audit notifications, only when a Control Plane endpoint is
    // configured.
    if settings.bridge.control_plane_path.is_some() {
        let (notifier, notifier_task) = notifier_pair(&settings.bridge);
        state.connection_manager.set_observer(Arc::new(notifier));
        let shutdown = state.lifecycle.subscribe_shutdown();
        tokio::spawn(async move {
            notifier_task.run(shutdown).await;
        });
    }

    // Bridge request/response server for the Control Plane
    let bridge = Arc::new(BridgeServer::new(
        &settings.bridge,
        state.connection_manager.clone(),
        state.lifecycle.clone(),
        state.aggregator.clone(),
    ));
    let bridge_shutdown = state.lifecycle.subscribe_shutdown();
    let bridge_handle = tokio::spawn(async move {
        if let Err(e) = bridge.run(bridge_shutdown).await {
            tracing::error!(error = %e, "Bridge server failed");
        }
    });

    // Stats aggregation/broadcast task
    let aggregator = state.aggregator.clone();
    let stats_shutdown = state.lifecycle.subscribe_shutdown();
    let stats_handle = tokio::spawn(async move {
        aggregator.run(stats_shutdown).await;
    });

    // Heartbeat + stale-connection cleanup task
    let heartbeat_task = HeartbeatTask::new(
        settings.websocket.clone(),
        state.connection_manager.clone(),
        state.lifecycle.subscribe_shutdown(),
    );
    let heartbeat_handle = tokio::spawn(async move {
        heartbeat_task.run().await;
    });

    // Rate-limit window eviction task
    let cleanup_task = RateLimitCleanupTask::new(
        &settings.ratelimit,
        state.limiter.clone(),
        state.lifecycle.subscribe_shutdown(),
    );
    let cleanup_handle = tokio::spawn(async move {
        cleanup_task.run().await;
    });

    // Create Axum app
    let lifecycle = state.lifecycle.clone();
    let app = create_app(state);

    // Start server
    let addr = settings.server_addr();
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    // Run server with graceful shutdown
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_handler(lifecycle))
        .await?;

    // Wait for background tasks to finish
    tracing::info!("Waiting for background tasks to finish...");
    let _ = tokio::join!(
        bridge_handle,
        stats_handle,
        heartbeat_handle,
        cleanup_handle
    );

    tracing::info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal_handler(lifecycle: Arc<Lifecycle>) {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            tracing::info!("Received terminate signal, initiating graceful shutdown");
        }
    }

    // Notify clients, drop connections, stop background tasks.
    lifecycle.trigger_shutdown();
}
