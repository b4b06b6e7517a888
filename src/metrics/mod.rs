//! Prometheus metrics for the broker: connection churn, event throughput,
//! rate limiting, fan-out drops, bridge traffic, and bandwidth.

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_counter_vec, register_int_gauge, Encoder, IntCounter,
    IntCounterVec, IntGauge, TextEncoder,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "wire";

lazy_static! {
    /// Number of currently registered connections
    pub static ref CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_connections_active", METRIC_PREFIX),
        "Number of currently registered connections"
    ).unwrap();

    /// Total connections opened since start
    pub static ref CONNECTIONS_OPENED: IntCounter = register_int_counter!(
        format!("{}_connections_opened_total", METRIC_PREFIX),
        "Total connections opened"
    ).unwrap();

    /// Total connections closed since start
    pub static ref CONNECTIONS_CLOSED: IntCounter = register_int_counter!(
        format!("{}_connections_closed_total", METRIC_PREFIX),
        "Total connections closed"
    ).unwrap();

    /// Events accepted per channel
    pub static ref EVENTS_PROCESSED: IntCounterVec = register_int_counter_vec!(
        format!("{}_events_processed_total", METRIC_PREFIX),
        "Events accepted by channel",
        &["channel"]
    ).unwrap();

    /// Events rejected per channel
    pub static ref EVENTS_REJECTED: IntCounterVec = register_int_counter_vec!(
        format!("{}_events_rejected_total", METRIC_PREFIX),
        "Events rejected by channel",
        &["channel"]
    ).unwrap();

    /// Rate-limited events
    pub static ref RATE_LIMIT_REJECTIONS: IntCounter = register_int_counter!(
        format!("{}_rate_limit_rejections_total", METRIC_PREFIX),
        "Events rejected by the rate limiter"
    ).unwrap();

    /// Rate-limit store failures (failed open)
    pub static ref RATE_LIMIT_BACKEND_ERRORS: IntCounter = register_int_counter!(
        format!("{}_rate_limit_backend_errors_total", METRIC_PREFIX),
        "Rate-limit store errors that failed open"
    ).unwrap();

    /// Broadcast sends dropped on full outbound queues
    pub static ref BROADCAST_DROPS: IntCounter = register_int_counter!(
        format!("{}_broadcast_drops_total", METRIC_PREFIX),
        "Broadcast sends dropped due to full outbound queues"
    ).unwrap();

    /// Bridge requests handled, by operation
    pub static ref BRIDGE_REQUESTS: IntCounterVec = register_int_counter_vec!(
        format!("{}_bridge_requests_total", METRIC_PREFIX),
        "Bridge requests handled, by operation",
        &["op"]
    ).unwrap();

    /// Bridge notification failures (Control Plane unreachable)
    pub static ref BRIDGE_FAILURES: IntCounter = register_int_counter!(
        format!("{}_bridge_failures_total", METRIC_PREFIX),
        "Outbound bridge notification failures"
    ).unwrap();

    /// Transport bytes received
    pub static ref BANDWIDTH_IN_BYTES: IntCounter = register_int_counter!(
        format!("{}_bandwidth_in_bytes_total", METRIC_PREFIX),
        "Transport bytes received"
    ).unwrap();

    /// Transport bytes sent
    pub static ref BANDWIDTH_OUT_BYTES: IntCounter = register_int_counter!(
        format!("{}_bandwidth_out_bytes_total", METRIC_PREFIX),
        "Transport bytes sent"
    ).unwrap();

    /// Stats ticks skipped because aggregation overran the interval
    pub static ref STATS_TICKS_SKIPPED: IntCounter = register_int_counter!(
        format!("{}_stats_ticks_skipped_total", METRIC_PREFIX),
        "Stats ticks skipped due to aggregation overrun"
    ).unwrap();
}

/// Encode all registered metrics in Prometheus text format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer)?;
    Ok(String::from_utf8(buffer).unwrap_or_default())
}
