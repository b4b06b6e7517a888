use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::broadcast;

use crate::config::WebSocketConfig;
use crate::connection::ConnectionManager;
use crate::websocket::{OutboundMessage, ServerMessage};

/// Background task for heartbeat and stale-connection cleanup.
///
/// Heartbeats go through the same bounded per-connection queues as
/// broadcasts; a consumer too slow to take a heartbeat burns its drop
/// budget like any other.
pub struct HeartbeatTask {
    config: WebSocketConfig,
    connection_manager: Arc<ConnectionManager>,
    shutdown: broadcast::Receiver<()>,
}

impl HeartbeatTask {
    pub fn new(
        config: WebSocketConfig,
        connection_manager: Arc<ConnectionManager>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            config,
            connection_manager,
            shutdown,
        }
    }

    /// Run the heartbeat and cleanup loops
    pub async fn run(mut self) {
        let heartbeat_interval = Duration::from_secs(self.config.heartbeat_interval.max(1));
        let cleanup_interval = Duration::from_secs(self.config.cleanup_interval.max(1));
        let connection_timeout = self.config.connection_timeout;

        let mut heartbeat_timer = tokio::time::interval(heartbeat_interval);
        let mut cleanup_timer = tokio::time::interval(cleanup_interval);

        // Skip immediate first tick
        heartbeat_timer.tick().await;
        cleanup_timer.tick().await;

        tracing::info!(
            heartbeat_interval_secs = self.config.heartbeat_interval,
            cleanup_interval_secs = self.config.cleanup_interval,
            connection_timeout_secs = connection_timeout,
            "Heartbeat task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Heartbeat task received shutdown signal");
                    break;
                }
                _ = heartbeat_timer.tick() => {
                    self.send_heartbeats();
                }
                _ = cleanup_timer.tick() => {
                    self.cleanup_stale_connections(connection_timeout);
                }
            }
        }

        tracing::info!("Heartbeat task stopped");
    }

    fn send_heartbeats(&self) {
        let connections = self.connection_manager.all_connections();
        if connections.is_empty() {
            return;
        }

        let start = Instant::now();
        let mut sent = 0usize;
        let mut dropped = 0usize;

        let heartbeat = OutboundMessage::Raw(ServerMessage::Heartbeat);
        for handle in &connections {
            if handle.try_send(heartbeat.clone()) {
                sent += 1;
            } else {
                dropped += 1;
            }
        }

        tracing::debug!(
            total = connections.len(),
            sent = sent,
            dropped = dropped,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Heartbeat round completed"
        );
    }

    fn cleanup_stale_connections(&self, timeout_secs: u64) {
        let removed = self.connection_manager.cleanup_stale(timeout_secs);
        if removed > 0 {
            tracing::info!(
                removed = removed,
                timeout_secs = timeout_secs,
                "Cleaned up stale connections"
            );
        }
    }
}
