//! Operational statistics: point-in-time snapshots, bandwidth accounting,
//! and the periodic aggregation/broadcast task.

mod aggregator;

pub use aggregator::StatsAggregator;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::channel::ChannelStats;

/// Immutable point-in-time aggregate. Never mutated after creation;
/// retained in a bounded ring buffer for trend queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatsSnapshot {
    pub timestamp: i64,
    pub total_connections: usize,
    pub rooms: usize,
    pub channels: HashMap<String, ChannelStats>,
    pub bandwidth_in: u64,
    pub bandwidth_out: u64,
    pub errors: u64,
}

/// Transport byte counters, fed by the WebSocket read/write loops.
#[derive(Debug, Default)]
pub struct BandwidthCounters {
    bytes_in: AtomicU64,
    bytes_out: AtomicU64,
}

impl BandwidthCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_in(&self, bytes: usize) {
        self.bytes_in.fetch_add(bytes as u64, Ordering::Relaxed);
        crate::metrics::BANDWIDTH_IN_BYTES.inc_by(bytes as u64);
    }

    pub fn record_out(&self, bytes: usize) {
        self.bytes_out.fetch_add(bytes as u64, Ordering::Relaxed);
        crate::metrics::BANDWIDTH_OUT_BYTES.inc_by(bytes as u64);
    }

    pub fn bytes_in(&self) -> u64 {
        self.bytes_in.load(Ordering::Relaxed)
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out.load(Ordering::Relaxed)
    }
}
