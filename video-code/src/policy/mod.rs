//! Request policies applied in front of the job service.

pub mod rate_limit;

pub use rate_limit::{ClientRateLimiter, RateDecision, RateLimitConfig};
