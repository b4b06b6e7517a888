use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::broadcast;
use tokio::time::MissedTickBehavior;

use crate::channel::{ChannelSet, ADMIN_CHANNEL};
use crate::config::StatsConfig;
use crate::connection::ConnectionManager;
use crate::ratelimit::RateLimiter;
use crate::websocket::ServerMessage;

use super::{BandwidthCounters, StatsSnapshot};

/// Samples the connection manager, every channel, and the bandwidth
/// counters on a fixed interval; retains a bounded history and pushes each
/// snapshot to the reserved admin channel.
pub struct StatsAggregator {
    connection_manager: Arc<ConnectionManager>,
    channels: Arc<ChannelSet>,
    limiter: Arc<RateLimiter>,
    bandwidth: Arc<BandwidthCounters>,
    interval: Duration,
    retention: usize,
    history: Mutex<VecDeque<StatsSnapshot>>,
}

impl StatsAggregator {
    pub fn new(
        config: &StatsConfig,
        connection_manager: Arc<ConnectionManager>,
        channels: Arc<ChannelSet>,
        limiter: Arc<RateLimiter>,
        bandwidth: Arc<BandwidthCounters>,
    ) -> Self {
        Self {
            connection_manager,
            channels,
            limiter,
            bandwidth,
            interval: Duration::from_millis(config.interval_ms.max(1)),
            retention: config.retention.max(1),
            history: Mutex::new(VecDeque::with_capacity(config.retention.max(1))),
        }
    }

    /// Run the aggregation loop until shutdown. A tick that overruns the
    /// interval causes the next tick to be skipped, never queued.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut timer = tokio::time::interval(self.interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            interval_ms = self.interval.as_millis() as u64,
            retention = self.retention,
            "Stats aggregator started"
        );

        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    tracing::info!("Stats aggregator received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    self.tick();
                }
            }
        }

        tracing::info!("Stats aggregator stopped");
    }

    /// One aggregation pass: build, retain, broadcast.
    pub fn tick(&self) -> StatsSnapshot {
        let started = std::time::Instant::now();
        let snapshot = self.build_snapshot();

        {
            let mut history = self
                .history
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            if history.len() == self.retention {
                history.pop_front();
            }
            history.push_back(snapshot.clone());
        }

        if let Some(admin) = self.channels.get(ADMIN_CHANNEL) {
            let update = ServerMessage::StatsUpdate {
                snapshot: snapshot.clone(),
            };
            let outcome = self.connection_manager.broadcast(admin, &update);
            tracing::debug!(
                connections = snapshot.total_connections,
                delivered = outcome.delivered,
                "Stats snapshot broadcast"
            );
        }

        // An overrun means the interval timer will skip the next tick.
        if started.elapsed() > self.interval {
            crate::metrics::STATS_TICKS_SKIPPED.inc();
            tracing::warn!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                interval_ms = self.interval.as_millis() as u64,
                "Stats aggregation overran its interval"
            );
        }

        snapshot
    }

    fn build_snapshot(&self) -> StatsSnapshot {
        let channels = self.channels.stats();
        let channel_errors: u64 = channels.values().map(|s| s.errors).sum();

        StatsSnapshot {
            timestamp: Utc::now().timestamp_millis(),
            total_connections: self.connection_manager.connection_count(),
            rooms: self.connection_manager.room_count(),
            channels,
            bandwidth_in: self.bandwidth.bytes_in(),
            bandwidth_out: self.bandwidth.bytes_out(),
            errors: channel_errors + self.limiter.backend_errors(),
        }
    }

    /// Most recent snapshots, oldest first.
    pub fn recent(&self, count: usize) -> Vec<StatsSnapshot> {
        let history = self
            .history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        history
            .iter()
            .skip(history.len().saturating_sub(count))
            .cloned()
            .collect()
    }

    pub fn latest(&self) -> Option<StatsSnapshot> {
        let history = self
            .history
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        history.back().cloned()
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}
