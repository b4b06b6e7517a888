use std::path::PathBuf;
use std::sync::Arc;

use serde_json::json;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::broadcast;

use crate::config::BridgeConfig;
use crate::connection::ConnectionManager;
use crate::error::BrokerError;
use crate::shutdown::Lifecycle;
use crate::stats::StatsAggregator;

use super::framing::{read_frame, write_frame};
use super::protocol::{BridgeOp, BridgeRequest, BridgeResponse};

/// Unix-domain-socket server answering Control Plane requests.
///
/// Runs beside the transport listener; a failure here never touches live
/// connections.
pub struct BridgeServer {
    socket_path: PathBuf,
    max_frame: usize,
    connection_manager: Arc<ConnectionManager>,
    lifecycle: Arc<Lifecycle>,
    aggregator: Arc<StatsAggregator>,
}

impl BridgeServer {
    pub fn new(
        config: &BridgeConfig,
        connection_manager: Arc<ConnectionManager>,
        lifecycle: Arc<Lifecycle>,
        aggregator: Arc<StatsAggregator>,
    ) -> Self {
        Self {
            socket_path: PathBuf::from(&config.socket_path),
            max_frame: config.max_frame_bytes,
            connection_manager,
            lifecycle,
            aggregator,
        }
    }

    /// Accept Control Plane connections until shutdown.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> std::io::Result<()> {
        // A previous process may have left the socket file behind.
        let _ = std::fs::remove_file(&self.socket_path);

        let listener = UnixListener::bind(&self.socket_path)?;
        restrict_permissions(&self.socket_path);

        tracing::info!(path = %self.socket_path.display(), "Bridge listening");

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Bridge received shutdown signal");
                    break;
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _)) => {
                            let server = self.clone();
                            tokio::spawn(async move {
                                server.handle_connection(stream).await;
                            });
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Bridge accept failed");
                        }
                    }
                }
            }
        }

        let _ = std::fs::remove_file(&self.socket_path);
        tracing::info!("Bridge stopped");
        Ok(())
    }

    async fn handle_connection(&self, mut stream: UnixStream) {
        loop {
            let request: BridgeRequest = match read_frame(&mut stream, self.max_frame).await {
                Ok(Some(request)) => request,
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!(error = %e, "Bridge frame error, closing connection");
                    break;
                }
            };

            crate::metrics::BRIDGE_REQUESTS
                .with_label_values(&[request.op.name()])
                .inc();
            tracing::debug!(
                correlation_id = %request.id,
                op = request.op.name(),
                "Bridge request"
            );

            let response = match self.dispatch(&request.op) {
                Ok(data) => BridgeResponse::ok(request.id, data),
                Err(e) => BridgeResponse::error(request.id, &e),
            };

            if let Err(e) = write_frame(&mut stream, &response, self.max_frame).await {
                tracing::warn!(error = %e, "Bridge response write failed");
                break;
            }
        }
    }

    fn dispatch(&self, op: &BridgeOp) -> Result<serde_json::Value, BrokerError> {
        match op {
            BridgeOp::Broadcast { channel, payload } => {
                let outcome = self.connection_manager.inject(channel, payload)?;
                Ok(json!({
                    "delivered": outcome.delivered,
                    "dropped": outcome.dropped,
                }))
            }
            BridgeOp::GetStatus => {
                let stats = self.connection_manager.stats();
                Ok(json!({
                    "state": self.lifecycle.state(),
                    "connections": stats.total_connections,
                    "rooms": stats.rooms.len(),
                    "snapshot": self.aggregator.latest(),
                }))
            }
            BridgeOp::Start => {
                self.lifecycle.start();
                Ok(json!({"state": self.lifecycle.state()}))
            }
            BridgeOp::Stop => {
                self.lifecycle.stop();
                Ok(json!({"state": self.lifecycle.state()}))
            }
            BridgeOp::Restart => {
                self.lifecycle.restart();
                Ok(json!({"state": self.lifecycle.state()}))
            }
        }
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &PathBuf) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(e) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        tracing::warn!(path = %path.display(), error = %e, "Failed to restrict bridge socket permissions");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &PathBuf) {}
