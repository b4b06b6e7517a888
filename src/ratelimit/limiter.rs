use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;

use crate::config::TierLimits;
use crate::error::BrokerError;
use crate::tier::Tier;

use super::window::SlidingWindow;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited { retry_after_secs: u64 },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed)
    }
}

/// Raw store decision before tier policy is applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreDecision {
    Allowed,
    Limited { retry_after_secs: u64 },
}

/// Counting backend seam. The in-memory store below cannot fail, but the
/// seam returns `Result` so alternative backends surface errors to the
/// fail-open handling in [`RateLimiter::check`].
pub trait RateLimitStore: Send + Sync {
    fn check_and_increment(
        &self,
        identity: &str,
        limit: u32,
        period: Duration,
    ) -> Result<StoreDecision, BrokerError>;

    /// Evict windows idle longer than `idle_cutoff`. Returns eviction count.
    fn cleanup_idle(&self, idle_cutoff: Duration) -> usize;

    fn tracked_identities(&self) -> usize;
}

/// In-memory window store. Each identity owns its window exclusively, so
/// concurrent calls for different identities never contend (DashMap shards
/// by key).
#[derive(Default)]
pub struct MemoryRateLimitStore {
    windows: DashMap<String, SlidingWindow>,
}

impl MemoryRateLimitStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RateLimitStore for MemoryRateLimitStore {
    fn check_and_increment(
        &self,
        identity: &str,
        limit: u32,
        period: Duration,
    ) -> Result<StoreDecision, BrokerError> {
        let now = Instant::now();

        match self.windows.entry(identity.to_string()) {
            Entry::Vacant(slot) => {
                // A fresh window counts the call that created it.
                slot.insert(SlidingWindow::new(now));
                Ok(StoreDecision::Allowed)
            }
            Entry::Occupied(mut slot) => {
                let window = slot.get_mut();
                if window.check_and_increment(limit, period, now) {
                    Ok(StoreDecision::Allowed)
                } else {
                    Ok(StoreDecision::Limited {
                        retry_after_secs: window.retry_after(period, now),
                    })
                }
            }
        }
    }

    fn cleanup_idle(&self, idle_cutoff: Duration) -> usize {
        let now = Instant::now();
        let before = self.windows.len();
        self.windows
            .retain(|_, window| window.idle_since(now) < idle_cutoff);
        before - self.windows.len()
    }

    fn tracked_identities(&self) -> usize {
        self.windows.len()
    }
}

/// Statistics about the rate limiter
#[derive(Debug, Clone, Serialize)]
pub struct RateLimiterStats {
    pub tracked_identities: usize,
    pub rejections: u64,
    pub backend_errors: u64,
}

/// Tiered rate limiter over a pluggable window store.
pub struct RateLimiter {
    store: Box<dyn RateLimitStore>,
    limits: TierLimits,
    window: Duration,
    rejections: AtomicU64,
    backend_errors: AtomicU64,
}

impl RateLimiter {
    pub fn new(limits: TierLimits, window: Duration) -> Self {
        Self::with_store(Box::new(MemoryRateLimitStore::new()), limits, window)
    }

    pub fn with_store(store: Box<dyn RateLimitStore>, limits: TierLimits, window: Duration) -> Self {
        Self {
            store,
            limits,
            window,
            rejections: AtomicU64::new(0),
            backend_errors: AtomicU64::new(0),
        }
    }

    /// Check one event against the identity's tier budget.
    ///
    /// `admin` is unlimited. A store error is fail-open: the event is
    /// allowed, the error counted and logged, never propagated to the
    /// delivery path.
    pub fn check(&self, identity: &str, tier: Tier) -> RateLimitDecision {
        let Some(limit) = self.limits.limit_for(tier) else {
            return RateLimitDecision::Allowed;
        };

        match self.store.check_and_increment(identity, limit, self.window) {
            Ok(StoreDecision::Allowed) => RateLimitDecision::Allowed,
            Ok(StoreDecision::Limited { retry_after_secs }) => {
                self.rejections.fetch_add(1, Ordering::Relaxed);
                crate::metrics::RATE_LIMIT_REJECTIONS.inc();
                RateLimitDecision::Limited { retry_after_secs }
            }
            Err(e) => {
                self.backend_errors.fetch_add(1, Ordering::Relaxed);
                crate::metrics::RATE_LIMIT_BACKEND_ERRORS.inc();
                tracing::warn!(
                    identity = %identity,
                    error = %e,
                    "Rate limit store error, failing open"
                );
                RateLimitDecision::Allowed
            }
        }
    }

    /// Evict windows idle longer than 2× the window period.
    pub fn cleanup(&self) -> usize {
        let removed = self.store.cleanup_idle(self.window * 2);
        if removed > 0 {
            tracing::debug!(
                removed = removed,
                tracked = self.store.tracked_identities(),
                "Evicted idle rate-limit windows"
            );
        }
        removed
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn backend_errors(&self) -> u64 {
        self.backend_errors.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> RateLimiterStats {
        RateLimiterStats {
            tracked_identities: self.store.tracked_identities(),
            rejections: self.rejections.load(Ordering::Relaxed),
            backend_errors: self.backend_errors.load(Ordering::Relaxed),
        }
    }
}
