//! Carrier-aware rate limiting

mod limiter;

pub use limiter::{EffectiveLimits, RateLimiter, WINDOW};
