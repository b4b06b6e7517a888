mod settings;

pub use settings::{
    ApiKeyConfig, AuthConfig, BridgeConfig, OtelConfig, RateLimitConfig, ServerConfig, Settings,
    StatsConfig, TierLimits, WebSocketConfig,
};
