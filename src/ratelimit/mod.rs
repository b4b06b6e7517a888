//! Tiered sliding-window rate limiting.
//!
//! One window per identity, budget drawn from the identity's tier. The
//! limiter is deliberately fail-open: an error from the counting store
//! allows the event through and is recorded, so rate limiting can never
//! become a single point of failure for message delivery.

mod limiter;
mod window;

pub use limiter::{
    MemoryRateLimitStore, RateLimitDecision, RateLimiter, RateLimiterStats, RateLimitStore,
    StoreDecision,
};
pub use window::SlidingWindow;
