use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::channel::ChannelSet;
use crate::config::Settings;
use crate::connection::ConnectionManager;
use crate::ratelimit::RateLimiter;
use crate::shutdown::Lifecycle;
use crate::stats::{BandwidthCounters, StatsAggregator};
use crate::tier::{JwtCredentialIssuer, TierResolver};

/// Shared application state. Every component owns its own data and is
/// injected here by handle; nothing reads from ambient global state.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub channels: Arc<ChannelSet>,
    pub connection_manager: Arc<ConnectionManager>,
    pub limiter: Arc<RateLimiter>,
    pub aggregator: Arc<StatsAggregator>,
    pub lifecycle: Arc<Lifecycle>,
    pub bandwidth: Arc<BandwidthCounters>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let settings = Arc::new(settings);
        let channels = Arc::new(ChannelSet::new());

        let issuer = Arc::new(JwtCredentialIssuer::new(&settings.auth));
        let resolver = Arc::new(TierResolver::new(&settings.auth, issuer));

        let limiter = Arc::new(RateLimiter::new(
            settings.tiers,
            Duration::from_secs(settings.ratelimit.window_secs),
        ));

        let connection_manager = Arc::new(ConnectionManager::new(
            settings.websocket.clone(),
            channels.clone(),
            resolver,
            limiter.clone(),
        ));

        let bandwidth = Arc::new(BandwidthCounters::new());
        let aggregator = Arc::new(StatsAggregator::new(
            &settings.stats,
            connection_manager.clone(),
            channels.clone(),
            limiter.clone(),
            bandwidth.clone(),
        ));

        let lifecycle = Arc::new(Lifecycle::new(connection_manager.clone()));

        Self {
            settings,
            channels,
            connection_manager,
            limiter,
            aggregator,
            lifecycle,
            bandwidth,
            start_time: Instant::now(),
        }
    }
}
