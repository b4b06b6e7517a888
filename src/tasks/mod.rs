//! Periodic background tasks. Each takes the same fine-grained locks as
//! the hot path, never a broader one.

mod heartbeat;

pub use heartbeat::HeartbeatTask;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::config::RateLimitConfig;
use crate::ratelimit::RateLimiter;

/// Evicts rate-limit windows idle longer than 2× the window period.
pub struct RateLimitCleanupTask {
    limiter: Arc<RateLimiter>,
    interval: Duration,
    shutdown: broadcast::Receiver<()>,
}

impl RateLimitCleanupTask {
    pub fn new(
        config: &RateLimitConfig,
        limiter: Arc<RateLimiter>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            limiter,
            interval: Duration::from_secs(config.cleanup_interval_secs.max(1)),
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.interval);
        timer.tick().await;

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Rate-limit cleanup task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Rate-limit cleanup task received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    self.limiter.cleanup();
                }
            }
        }

        tracing::info!("Rate-limit cleanup task stopped");
    }
}
