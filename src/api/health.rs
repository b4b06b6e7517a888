//! Health check and statistics endpoints.

use std::collections::HashMap;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::channel::ChannelStats;
use crate::connection::ConnectionManagerStats;
use crate::error::BrokerError;
use crate::ratelimit::RateLimiterStats;
use crate::server::AppState;
use crate::stats::StatsSnapshot;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub connections: ConnectionHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct ConnectionHealthResponse {
    pub total: usize,
    pub rooms: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub state: String,
    pub connections: ConnectionManagerStats,
    pub channels: HashMap<String, ChannelStats>,
    pub ratelimit: RateLimiterStats,
    /// Retained snapshot ring, oldest first.
    pub recent_snapshots: Vec<StatsSnapshot>,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: state.lifecycle.state().to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        connections: ConnectionHealthResponse {
            total: state.connection_manager.connection_count(),
            rooms: state.connection_manager.room_count(),
        },
    })
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let retention = state.settings.stats.retention;
    Json(StatsResponse {
        state: state.lifecycle.state().to_string(),
        connections: state.connection_manager.stats(),
        channels: state.channels.stats(),
        ratelimit: state.limiter.stats(),
        recent_snapshots: state.aggregator.recent(retention),
    })
}

pub async fn metrics() -> Result<String, BrokerError> {
    crate::metrics::encode_metrics().map_err(|e| BrokerError::Internal(e.to_string()))
}
