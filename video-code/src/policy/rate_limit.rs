//! Per-client request rate limiting.
//!
//! Fixed one-minute windows keyed by `epoch_secs / 60`. Memory is bounded by
//! evicting idle clients and capping the number of tracked clients.

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::config::AppConfig;

/// Configuration for a [`ClientRateLimiter`].
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Requests allowed per client per window.
    pub limit_per_window: u32,
    /// Window length in seconds.
    pub window_secs: u64,
    /// Clients idle longer than this are forgotten.
    pub idle_expiry_secs: u64,
    /// Maximum number of tracked clients.
    pub max_clients: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            limit_per_window: 120,
            window_secs: 60,
            idle_expiry_secs: 5 * 60,
            max_clients: 10_000,
        }
    }
}

impl RateLimitConfig {
    pub fn per_minute(limit: u32) -> Self {
        Self {
            limit_per_window: limit,
            ..Default::default()
        }
    }

    pub fn from_app_config(config: &AppConfig) -> Self {
        Self::per_minute(config.rate_limit_per_minute)
    }
}

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Limited,
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed { .. })
    }
}

#[derive(Debug)]
struct ClientWindow {
    window: u64,
    count: u32,
    last_seen: u64,
}

/// Fixed-window rate limiter keyed by client identity.
#[derive(Debug)]
pub struct ClientRateLimiter {
    config: RateLimitConfig,
    clients: DashMap<String, ClientWindow>,
}

impl ClientRateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            clients: DashMap::new(),
        }
    }

    /// Count one request from `client` at the current time.
    pub fn check(&self, client: &str) -> RateDecision {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.check_at(client, now)
    }

    /// Count one request from `client` at `now` (epoch seconds).
    pub fn check_at(&self, client: &str, now: u64) -> RateDecision {
        let window = now / self.config.window_secs.max(1);

        if !self.clients.contains_key(client) && self.clients.len() >= self.config.max_clients {
            self.make_room(now);
        }

        let mut entry = self
            .clients
            .entry(client.to_string())
            .or_insert(ClientWindow {
                window,
                count: 0,
                last_seen: now,
            });

        if entry.window != window {
            entry.window = window;
            entry.count = 0;
        }
        entry.last_seen = now;
        entry.count = entry.count.saturating_add(1);

        if entry.count > self.config.limit_per_window {
            trace!(client = %client, count = entry.count, "Request rate limited");
            RateDecision::Limited
        } else {
            RateDecision::Allowed {
                remaining: self.config.limit_per_window - entry.count,
            }
        }
    }

    /// Forget clients idle for longer than the expiry. Returns how many were removed.
    pub fn purge_idle(&self, now: u64) -> usize {
        let before = self.clients.len();
        let expiry = self.config.idle_expiry_secs;
        self.clients
            .retain(|_, w| now.saturating_sub(w.last_seen) <= expiry);
        let removed = before.saturating_sub(self.clients.len());
        if removed > 0 {
            debug!(removed, "Purged idle rate-limit entries");
        }
        removed
    }

    fn make_room(&self, now: u64) {
        if self.purge_idle(now) > 0 && self.clients.len() < self.config.max_clients {
            return;
        }
        let oldest = self
            .clients
            .iter()
            .min_by_key(|e| e.value().last_seen)
            .map(|e| e.key().clone());
        if let Some(key) = oldest {
            self.clients.remove(&key);
        }
    }

    pub fn tracked_clients(&self) -> usize {
        self.clients.len()
    }
}

impl Default for ClientRateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}
