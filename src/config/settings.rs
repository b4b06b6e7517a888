use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::env;

use crate::tier::Tier;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub tiers: TierLimits,
    #[serde(default)]
    pub ratelimit: RateLimitConfig,
    #[serde(default)]
    pub stats: StatsConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Origins allowed to open transport connections. Empty means any.
    #[serde(default)]
    pub allowed_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// HMAC secret for administrative tokens.
    #[serde(default)]
    pub admin_secret: String,
    /// HMAC secret for federation capability tokens. Unset disables the
    /// federation verification step.
    #[serde(default)]
    pub federation_secret: Option<String>,
    pub issuer: Option<String>,
    pub audience: Option<String>,
    /// Long-lived API keys known to the Control Plane, with tier metadata.
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
    /// TTL for cached credential resolutions, in seconds.
    #[serde(default = "default_resolver_cache_ttl")]
    pub cache_ttl_seconds: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiKeyConfig {
    pub key: String,
    pub tier: Tier,
    pub identity: String,
}

/// Per-minute message budgets per tier. `admin` is unlimited and has no knob.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct TierLimits {
    #[serde(default = "default_free_limit")]
    pub free: u32,
    #[serde(default = "default_freewire_limit")]
    pub freewire: u32,
    #[serde(default = "default_wire_limit")]
    pub wire: u32,
    #[serde(default = "default_extrawire_limit")]
    pub extrawire: u32,
}

impl TierLimits {
    /// Message budget for a tier within one rate-limit window.
    /// `None` means unlimited.
    pub fn limit_for(&self, tier: Tier) -> Option<u32> {
        match tier {
            Tier::Free => Some(self.free),
            Tier::Freewire => Some(self.freewire),
            Tier::Wire => Some(self.wire),
            Tier::Extrawire => Some(self.extrawire),
            Tier::Admin => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Sliding window length in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// Interval between idle-window eviction sweeps, in seconds.
    #[serde(default = "default_ratelimit_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatsConfig {
    /// Aggregation tick interval in milliseconds.
    #[serde(default = "default_stats_interval_ms")]
    pub interval_ms: u64,
    /// Number of snapshots retained for trend queries.
    #[serde(default = "default_stats_retention")]
    pub retention: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BridgeConfig {
    /// Unix domain socket the broker listens on for Control Plane requests.
    #[serde(default = "default_bridge_socket")]
    pub socket_path: String,
    /// Unix domain socket of the Control Plane's audit endpoint, if any.
    #[serde(default)]
    pub control_plane_path: Option<String>,
    #[serde(default = "default_bridge_timeout_ms")]
    pub response_timeout_ms: u64,
    #[serde(default = "default_bridge_max_frame")]
    pub max_frame_bytes: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Outbound queue depth per connection; overflow counts toward the
    /// disconnect budget.
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue_size: usize,
    /// Cumulative dropped sends before a slow consumer is disconnected.
    #[serde(default = "default_max_send_drops")]
    pub max_send_drops: u64,
    /// Heartbeat interval in seconds (server sends ping)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// Connection timeout in seconds (disconnect if no activity)
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: u64,
    /// Cleanup task interval in seconds
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    #[serde(default = "default_max_connections_per_identity")]
    pub max_connections_per_identity: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_otel_service_name")]
    pub service_name: String,
    #[serde(default = "default_otel_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8090
}

fn default_resolver_cache_ttl() -> u64 {
    60
}

fn default_free_limit() -> u32 {
    10
}

fn default_freewire_limit() -> u32 {
    30
}

fn default_wire_limit() -> u32 {
    100
}

fn default_extrawire_limit() -> u32 {
    500
}

fn default_window_secs() -> u64 {
    60
}

fn default_ratelimit_cleanup_interval() -> u64 {
    60
}

fn default_stats_interval_ms() -> u64 {
    2000
}

fn default_stats_retention() -> usize {
    20
}

fn default_bridge_socket() -> String {
    "/tmp/wire-broker.sock".to_string()
}

fn default_bridge_timeout_ms() -> u64 {
    5000
}

fn default_bridge_max_frame() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_outbound_queue() -> usize {
    32
}

fn default_max_send_drops() -> u64 {
    100
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_connection_timeout() -> u64 {
    120
}

fn default_cleanup_interval() -> u64 {
    60
}

fn default_max_connections() -> usize {
    10_000
}

fn default_max_connections_per_identity() -> usize {
    5
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_otel_service_name() -> String {
    "wire-broker".to_string()
}

fn default_otel_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8090)?
            .set_default("ratelimit.window_secs", 60)?
            .set_default("stats.interval_ms", 2000)?
            .set_default("stats.retention", 20)?
            .set_default("bridge.socket_path", "/tmp/wire-broker.sock")?
            .set_default("bridge.response_timeout_ms", 5000)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // SERVER_HOST, SERVER_PORT, AUTH_ADMIN_SECRET, BRIDGE_SOCKET_PATH, etc.
            .add_source(
                Environment::default()
                    .separator("_")
                    .try_parsing(true)
                    .list_separator(","),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            allowed_origins: vec![],
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_secret: String::new(),
            federation_secret: None,
            issuer: None,
            audience: None,
            api_keys: vec![],
            cache_ttl_seconds: default_resolver_cache_ttl(),
        }
    }
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            free: default_free_limit(),
            freewire: default_freewire_limit(),
            wire: default_wire_limit(),
            extrawire: default_extrawire_limit(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            cleanup_interval_secs: default_ratelimit_cleanup_interval(),
        }
    }
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_stats_interval_ms(),
            retention: default_stats_retention(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            socket_path: default_bridge_socket(),
            control_plane_path: None,
            response_timeout_ms: default_bridge_timeout_ms(),
            max_frame_bytes: default_bridge_max_frame(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            outbound_queue_size: default_outbound_queue(),
            max_send_drops: default_max_send_drops(),
            heartbeat_interval: default_heartbeat_interval(),
            connection_timeout: default_connection_timeout(),
            cleanup_interval: default_cleanup_interval(),
            max_connections: default_max_connections(),
            max_connections_per_identity: default_max_connections_per_identity(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_otel_service_name(),
            sampling_ratio: default_otel_sampling_ratio(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 8090);
    }

    #[test]
    fn test_default_tier_budgets() {
        let limits = TierLimits::default();
        assert_eq!(limits.limit_for(Tier::Free), Some(10));
        assert_eq!(limits.limit_for(Tier::Freewire), Some(30));
        assert_eq!(limits.limit_for(Tier::Wire), Some(100));
        assert_eq!(limits.limit_for(Tier::Extrawire), Some(500));
        assert_eq!(limits.limit_for(Tier::Admin), None);
    }

    #[test]
    fn test_default_stats_interval() {
        let stats = StatsConfig::default();
        assert_eq!(stats.interval_ms, 2000);
        assert_eq!(stats.retention, 20);
    }
}
