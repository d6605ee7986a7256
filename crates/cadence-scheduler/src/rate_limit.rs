//! Fixed-window request counting per (actor, resource) key.
//!
//! Process-local admission control. Counters are lost on restart, which only
//! ever makes the limiter more permissive for one window.

use dashmap::DashMap;
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::config::{RateLimit, RateLimitConfig};

/// Outcome of a limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// Whole seconds until the window resets, set on denial.
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            retry_after_secs: None,
        }
    }

    fn deny(retry_after_secs: u64) -> Self {
        Self {
            allowed: false,
            retry_after_secs: Some(retry_after_secs),
        }
    }
}

/// Aggregate limiter statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct RateLimitStats {
    pub active_keys: usize,
    /// Mean of `count / max_requests` across active keys.
    pub average_usage: f64,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: Instant,
    limit: RateLimit,
}

/// Fixed-window rate limiter.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: DashMap::new(),
        }
    }

    /// Count one request for `key`, scoped to `resource` when given.
    pub fn check_limit(&self, key: &str, resource: Option<&str>) -> RateLimitDecision {
        self.check_limit_at(key, resource, Instant::now())
    }

    pub fn check_limit_at(
        &self,
        key: &str,
        resource: Option<&str>,
        now: Instant,
    ) -> RateLimitDecision {
        let limit = self.config.limit_for(resource);
        let entry_key = match resource {
            Some(resource) => format!("{key}:{resource}"),
            None => key.to_string(),
        };

        let mut window = self.windows.entry(entry_key).or_insert(Window {
            count: 0,
            reset_at: now,
            limit,
        });

        if now >= window.reset_at {
            *window = Window {
                count: 1,
                reset_at: now + limit.window(),
                limit,
            };
            return RateLimitDecision::allow();
        }

        if window.count >= window.limit.max_requests {
            let remaining = window.reset_at - now;
            let retry_after = remaining.as_millis().div_ceil(1000) as u64;
            debug!(key, ?resource, retry_after, "rate limit exceeded");
            return RateLimitDecision::deny(retry_after.max(1));
        }

        window.count += 1;
        trace!(key, ?resource, count = window.count, "rate limit counted");
        RateLimitDecision::allow()
    }

    /// Drop windows that have already reset.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, window| window.reset_at > now);
        let removed = before.saturating_sub(self.windows.len());
        if removed > 0 {
            debug!(removed, "cleaned up expired rate limit windows");
        }
        removed
    }

    pub fn stats(&self) -> RateLimitStats {
        let active_keys = self.windows.len();
        if active_keys == 0 {
            return RateLimitStats::default();
        }
        let total: f64 = self
            .windows
            .iter()
            .map(|w| f64::from(w.count) / f64::from(w.limit.max_requests))
            .sum();
        RateLimitStats {
            active_keys,
            average_usage: total / active_keys as f64,
        }
    }
}
