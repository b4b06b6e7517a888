use std::path::PathBuf;
use std::time::Duration;

use tokio::net::UnixStream;
use tokio::sync::{broadcast, mpsc};
use tokio::time::timeout;

use crate::config::BridgeConfig;
use crate::connection::{ConnectionHandle, ConnectionObserver};

use super::backoff::ExponentialBackoff;
use super::framing::write_frame;
use super::protocol::BridgeNotification;

/// Queue depth between the hot path and the notifier task. Overflow drops
/// the notification; audit events must never block connection handling.
const NOTIFY_QUEUE_SIZE: usize = 256;

/// Build the observer half and its background task.
pub fn notifier_pair(config: &BridgeConfig) -> (BridgeNotifier, BridgeNotifierTask) {
    let (tx, rx) = mpsc::channel(NOTIFY_QUEUE_SIZE);
    (
        BridgeNotifier { tx },
        BridgeNotifierTask {
            control_plane_path: config
                .control_plane_path
                .as_ref()
                .map(PathBuf::from)
                .expect("notifier requires a control plane path"),
            response_timeout: Duration::from_millis(config.response_timeout_ms),
            max_frame: config.max_frame_bytes,
            rx,
        },
    )
}

/// Hot-path half: enqueues audit notifications without blocking.
pub struct BridgeNotifier {
    tx: mpsc::Sender<BridgeNotification>,
}

impl BridgeNotifier {
    fn enqueue(&self, notification: BridgeNotification) {
        if self.tx.try_send(notification).is_err() {
            crate::metrics::BRIDGE_FAILURES.inc();
            tracing::debug!("Bridge notification queue full, dropping audit event");
        }
    }
}

impl ConnectionObserver for BridgeNotifier {
    fn connection_opened(&self, handle: &ConnectionHandle) {
        self.enqueue(BridgeNotification::opened(handle));
    }

    fn connection_closed(&self, handle: &ConnectionHandle) {
        self.enqueue(BridgeNotification::closed(handle));
    }
}

/// Background half: owns the Control Plane connection, reconnecting with
/// jittered exponential backoff. Unreachable endpoint means dropped
/// notifications and a `BridgeUnavailable` count, never an error on any
/// live connection.
pub struct BridgeNotifierTask {
    control_plane_path: PathBuf,
    response_timeout: Duration,
    max_frame: usize,
    rx: mpsc::Receiver<BridgeNotification>,
}

impl BridgeNotifierTask {
    pub async fn run(mut self, mut shutdown: broadcast::Receiver<()>) {
        let mut stream: Option<UnixStream> = None;
        let mut backoff = ExponentialBackoff::new();
        // When the Control Plane is down, reconnects are gated by this
        // deadline instead of sleeping: the loop stays responsive and
        // notifications in the outage window are dropped, not queued.
        let mut next_attempt = tokio::time::Instant::now();

        tracing::info!(
            path = %self.control_plane_path.display(),
            "Bridge notifier started"
        );

        loop {
            let notification = tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Bridge notifier received shutdown signal");
                    break;
                }
                notification = self.rx.recv() => {
                    match notification {
                        Some(n) => n,
                        None => break,
                    }
                }
            };

            if stream.is_none() {
                if tokio::time::Instant::now() < next_attempt {
                    self.record_unavailable(&notification, "backing off", &backoff);
                    continue;
                }
                match timeout(self.response_timeout, UnixStream::connect(&self.control_plane_path))
                    .await
                {
                    Ok(Ok(connected)) => {
                        backoff.reset();
                        stream = Some(connected);
                    }
                    Ok(Err(e)) => {
                        next_attempt = tokio::time::Instant::now() + backoff.next_delay();
                        self.record_unavailable(&notification, &e.to_string(), &backoff);
                        continue;
                    }
                    Err(_) => {
                        next_attempt = tokio::time::Instant::now() + backoff.next_delay();
                        self.record_unavailable(&notification, "connect timed out", &backoff);
                        continue;
                    }
                }
            }

            let conn = stream.as_mut().expect("stream connected above");
            match timeout(
                self.response_timeout,
                write_frame(conn, &notification, self.max_frame),
            )
            .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    stream = None;
                    next_attempt = tokio::time::Instant::now() + backoff.next_delay();
                    self.record_unavailable(&notification, &e.to_string(), &backoff);
                }
                Err(_) => {
                    stream = None;
                    next_attempt = tokio::time::Instant::now() + backoff.next_delay();
                    self.record_unavailable(&notification, "write timed out", &backoff);
                }
            }
        }

        tracing::info!("Bridge notifier stopped");
    }

    fn record_unavailable(
        &self,
        notification: &BridgeNotification,
        reason: &str,
        backoff: &ExponentialBackoff,
    ) {
        crate::metrics::BRIDGE_FAILURES.inc();
        tracing::warn!(
            event = %notification.event,
            connection_id = %notification.connection_id,
            reason = %reason,
            attempt = backoff.attempt(),
            "Control Plane unreachable, dropping audit notification"
        );
    }
}
