//! Lifecycle control and graceful shutdown.
//!
//! The Control Plane drives `start`/`stop`/`restart` through the Bridge;
//! the same machinery serves process shutdown on SIGINT/SIGTERM. Stopping
//! notifies every client before tearing its connection down, so well-behaved
//! clients reconnect instead of hammering a dead endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;

use crate::connection::ConnectionManager;
use crate::websocket::{OutboundMessage, ServerMessage};

/// Suggested reconnect delay sent to clients on stop.
const RECONNECT_AFTER_SECS: u64 = 5;

/// Broker lifecycle state shared between the transport listener, the
/// Bridge, and the shutdown path.
pub struct Lifecycle {
    accepting: AtomicBool,
    connection_manager: Arc<ConnectionManager>,
    shutdown_tx: broadcast::Sender<()>,
}

impl Lifecycle {
    pub fn new(connection_manager: Arc<ConnectionManager>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(8);
        Self {
            accepting: AtomicBool::new(true),
            connection_manager,
            shutdown_tx,
        }
    }

    /// Whether new transport connections are admitted.
    pub fn is_accepting(&self) -> bool {
        self.accepting.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> &'static str {
        if self.is_accepting() {
            "running"
        } else {
            "stopped"
        }
    }

    /// Resume accepting connections.
    pub fn start(&self) {
        let was_stopped = !self.accepting.swap(true, Ordering::SeqCst);
        if was_stopped {
            tracing::info!("Broker accepting connections again");
        }
    }

    /// Stop accepting, notify every client, and drop all connections.
    pub fn stop(&self) {
        let was_running = self.accepting.swap(false, Ordering::SeqCst);
        if !was_running {
            return;
        }

        let connections = self.connection_manager.all_connections();
        tracing::info!(connections = connections.len(), "Broker stopping");

        let notice = OutboundMessage::Raw(ServerMessage::Shutdown {
            reconnect_after_secs: RECONNECT_AFTER_SECS,
        });
        for handle in &connections {
            handle.try_send(notice.clone());
        }
        for handle in connections {
            self.connection_manager.disconnect(handle.id);
        }
    }

    pub fn restart(&self) {
        tracing::info!("Broker restart requested");
        self.stop();
        self.start();
    }

    /// Subscribe to the process-wide shutdown signal.
    pub fn subscribe_shutdown(&self) -> broadcast::Receiver<()> {
        self.shutdown_tx.subscribe()
    }

    pub fn shutdown_sender(&self) -> broadcast::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Full process shutdown: stop the broker and signal every background
    /// task.
    pub fn trigger_shutdown(&self) {
        self.stop();
        let _ = self.shutdown_tx.send(());
    }
}
