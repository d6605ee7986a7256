//! Scheduler configuration

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SchedulerError};

/// Largest civil offset accepted, in minutes (±18h).
pub const MAX_UTC_OFFSET_MINUTES: i32 = 18 * 60;

/// Top-level scheduler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// User whose schedules this scheduler drives
    #[serde(default = "default_user_id")]
    pub user_id: String,

    /// Civil timezone as a fixed offset east of UTC, in minutes
    #[serde(default = "default_utc_offset_minutes")]
    pub utc_offset_minutes: i32,

    /// Local hour of the content generation window
    #[serde(default = "default_content_hour")]
    pub content_hour: u32,

    /// Local hour of the analytics window
    #[serde(default = "default_analytics_hour")]
    pub analytics_hour: u32,

    /// Upper bound (exclusive) of the random minute offset added to each window
    #[serde(default = "default_trigger_jitter_minutes")]
    pub trigger_jitter_minutes: u32,

    /// How often the trigger loop compares the clock against armed windows
    #[serde(default = "default_trigger_check_secs")]
    pub trigger_check_secs: u64,

    /// How often finished jobs and expired rate windows are swept
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,

    /// Change-log polling interval used while the subscription is down
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Upper bound on how long an emergency stop waits for in-flight jobs
    #[serde(default = "default_emergency_drain_timeout_secs")]
    pub emergency_drain_timeout_secs: u64,

    /// Topics handed to the content generator, picked at random per slot
    #[serde(default = "default_topics")]
    pub topics: Vec<String>,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub retry: RetryPolicy,

    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    #[serde(default)]
    pub monitor: MonitorConfig,
}

fn default_user_id() -> String {
    "default".to_string()
}

fn default_utc_offset_minutes() -> i32 {
    330
}

fn default_content_hour() -> u32 {
    0
}

fn default_analytics_hour() -> u32 {
    23
}

fn default_trigger_jitter_minutes() -> u32 {
    60
}

fn default_trigger_check_secs() -> u64 {
    60
}

fn default_cleanup_interval_secs() -> u64 {
    3600
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_emergency_drain_timeout_secs() -> u64 {
    30
}

fn default_topics() -> Vec<String> {
    [
        "rust async patterns",
        "observability in small teams",
        "shipping side projects",
        "database indexing basics",
        "writing useful error messages",
    ]
    .into_iter()
    .map(String::from)
    .collect()
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            user_id: default_user_id(),
            utc_offset_minutes: default_utc_offset_minutes(),
            content_hour: default_content_hour(),
            analytics_hour: default_analytics_hour(),
            trigger_jitter_minutes: default_trigger_jitter_minutes(),
            trigger_check_secs: default_trigger_check_secs(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            emergency_drain_timeout_secs: default_emergency_drain_timeout_secs(),
            topics: default_topics(),
            queue: QueueConfig::default(),
            retry: RetryPolicy::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            rate_limit: RateLimitConfig::default(),
            monitor: MonitorConfig::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn trigger_check_interval(&self) -> Duration {
        Duration::from_secs(self.trigger_check_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn emergency_drain_timeout(&self) -> Duration {
        Duration::from_secs(self.emergency_drain_timeout_secs)
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.utc_offset_minutes.abs() > MAX_UTC_OFFSET_MINUTES {
            return Err(SchedulerError::InvalidConfig(format!(
                "utc_offset_minutes {} outside ±{}",
                self.utc_offset_minutes, MAX_UTC_OFFSET_MINUTES
            )));
        }
        for (name, hour) in [
            ("content_hour", self.content_hour),
            ("analytics_hour", self.analytics_hour),
        ] {
            if hour >= 24 {
                return Err(SchedulerError::InvalidConfig(format!(
                    "{name} must be below 24, got {hour}"
                )));
            }
        }
        if self.trigger_jitter_minutes == 0 || self.trigger_jitter_minutes > 60 {
            return Err(SchedulerError::InvalidConfig(
                "trigger_jitter_minutes must be in 1..=60".to_string(),
            ));
        }
        if self.trigger_check_secs == 0
            || self.poll_interval_secs == 0
            || self.cleanup_interval_secs == 0
            || self.monitor.interval_secs == 0
        {
            return Err(SchedulerError::InvalidConfig(
                "trigger, poll, cleanup and monitor intervals must be positive".to_string(),
            ));
        }
        if self.topics.is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "at least one topic is required".to_string(),
            ));
        }
        self.queue.validate()?;
        self.retry.validate()?;
        self.circuit_breaker.validate()?;
        self.rate_limit.validate()?;
        Ok(())
    }
}

/// Job queue settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Dispatch tick interval in seconds
    #[serde(default = "default_dispatch_interval_secs")]
    pub dispatch_interval_secs: u64,

    /// Most jobs claimed per tick
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Attempts allowed before a job fails terminally
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    /// How long finished jobs are kept before cleanup, in hours
    #[serde(default = "default_retention_hours")]
    pub retention_hours: u64,

    /// Capacity of the lifecycle event channel
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_dispatch_interval_secs() -> u64 {
    30
}

fn default_batch_size() -> usize {
    5
}

fn default_max_retries() -> u32 {
    3
}

fn default_retention_hours() -> u64 {
    7 * 24
}

fn default_event_capacity() -> usize {
    1024
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_secs: default_dispatch_interval_secs(),
            batch_size: default_batch_size(),
            default_max_retries: default_max_retries(),
            retention_hours: default_retention_hours(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl QueueConfig {
    pub fn dispatch_interval(&self) -> Duration {
        Duration::from_secs(self.dispatch_interval_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.retention_hours as i64)
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(SchedulerError::InvalidConfig(
                "queue.batch_size must be positive".to_string(),
            ));
        }
        if self.dispatch_interval_secs == 0 || self.event_capacity == 0 {
            return Err(SchedulerError::InvalidConfig(
                "queue.dispatch_interval_secs and queue.event_capacity must be positive"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

/// Exponential backoff applied between job attempts
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_base_ms")]
    pub base_ms: u64,

    #[serde(default = "default_factor")]
    pub factor: f64,

    #[serde(default = "default_cap_ms")]
    pub cap_ms: u64,

    /// Largest jitter as a fraction of the capped delay
    #[serde(default = "default_jitter_ratio")]
    pub jitter_ratio: f64,
}

fn default_base_ms() -> u64 {
    1_000
}

fn default_factor() -> f64 {
    2.0
}

fn default_cap_ms() -> u64 {
    300_000
}

fn default_jitter_ratio() -> f64 {
    0.1
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_ms: default_base_ms(),
            factor: default_factor(),
            cap_ms: default_cap_ms(),
            jitter_ratio: default_jitter_ratio(),
        }
    }
}

impl RetryPolicy {
    /// `min(cap, base * factor^retry_count)` plus up to `jitter_ratio` of that.
    ///
    /// `jitter_fraction` is a sample from `[0, 1)`.
    pub fn delay_ms(&self, retry_count: u32, jitter_fraction: f64) -> u64 {
        let exp = self.base_ms as f64 * self.factor.powi(retry_count.min(64) as i32);
        let capped = exp.min(self.cap_ms as f64);
        let jitter = capped * self.jitter_ratio * jitter_fraction.clamp(0.0, 1.0);
        (capped + jitter) as u64
    }

    fn validate(&self) -> Result<()> {
        if self.base_ms == 0 || self.cap_ms < self.base_ms {
            return Err(SchedulerError::InvalidConfig(
                "retry.base_ms must be positive and no larger than retry.cap_ms".to_string(),
            ));
        }
        if self.factor.is_nan() || self.factor < 1.0 {
            return Err(SchedulerError::InvalidConfig(
                "retry.factor must be at least 1".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err(SchedulerError::InvalidConfig(
                "retry.jitter_ratio must be in [0, 1]".to_string(),
            ));
        }
        Ok(())
    }
}

/// Circuit breaker settings shared by every key
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    /// Consecutive-ish failures that open a circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long an open circuit blocks calls before allowing a trial, in seconds
    #[serde(default = "default_open_timeout_secs")]
    pub open_timeout_secs: u64,
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_open_timeout_secs() -> u64 {
    60
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            open_timeout_secs: default_open_timeout_secs(),
        }
    }
}

impl CircuitBreakerConfig {
    pub fn open_timeout(&self) -> Duration {
        Duration::from_secs(self.open_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.failure_threshold == 0 {
            return Err(SchedulerError::InvalidConfig(
                "circuit_breaker.failure_threshold must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// One fixed-window limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimit {
    pub max_requests: u32,
    pub window_secs: u64,
}

impl RateLimit {
    pub fn window(&self) -> Duration {
        Duration::from_secs(self.window_secs)
    }
}

/// Rate limiter settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Limit used when no resource override matches
    #[serde(default = "default_rate_limit")]
    pub default: RateLimit,

    /// Per-resource limits, keyed by resource name (usually a platform)
    #[serde(default)]
    pub overrides: HashMap<String, RateLimit>,
}

fn default_rate_limit() -> RateLimit {
    RateLimit {
        max_requests: 50,
        window_secs: 3600,
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            default: default_rate_limit(),
            overrides: HashMap::new(),
        }
    }
}

impl RateLimitConfig {
    /// Limit for a resource, falling back to the default.
    pub fn limit_for(&self, resource: Option<&str>) -> RateLimit {
        resource
            .and_then(|r| self.overrides.get(r))
            .copied()
            .unwrap_or(self.default)
    }

    fn validate(&self) -> Result<()> {
        let all = std::iter::once(("default", &self.default))
            .chain(self.overrides.iter().map(|(k, v)| (k.as_str(), v)));
        for (name, limit) in all {
            if limit.max_requests == 0 || limit.window_secs == 0 {
                return Err(SchedulerError::InvalidConfig(format!(
                    "rate limit {name} needs a positive request count and window"
                )));
            }
        }
        Ok(())
    }
}

/// Monitor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MonitorConfig {
    /// Snapshot and health-check interval in seconds
    #[serde(default = "default_monitor_interval_secs")]
    pub interval_secs: u64,

    /// Queue failure rate above which the queue check fails
    #[serde(default = "default_failure_rate_threshold")]
    pub failure_rate_threshold: f64,

    /// How long metric points are kept, in hours
    #[serde(default = "default_metric_retention_hours")]
    pub metric_retention_hours: u64,
}

fn default_monitor_interval_secs() -> u64 {
    60
}

fn default_failure_rate_threshold() -> f64 {
    0.5
}

fn default_metric_retention_hours() -> u64 {
    24
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_monitor_interval_secs(),
            failure_rate_threshold: default_failure_rate_threshold(),
            metric_retention_hours: default_metric_retention_hours(),
        }
    }
}

impl MonitorConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs.max(1))
    }

    pub fn metric_retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.metric_retention_hours as i64)
    }
}
