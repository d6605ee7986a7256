//! Autonomous content scheduler for Cadence.
//!
//! This crate provides an in-process scheduler that:
//! - Generates each day's posts from per-platform schedules in the user's civil time
//! - Queues generation and publishing as prioritised, retried jobs
//! - Protects external services with per-key circuit breakers and rate limits
//! - Reacts live to store changes, falling back to polling when the feed drops
//! - Records metrics and runs periodic health checks

mod circuit;
mod civil;
mod collaborators;
mod config;
mod error;
mod handlers;
mod listener;
mod memory;
mod monitor;
mod queue;
mod rate_limit;
mod scheduler;
mod types;

pub use circuit::{CircuitBreaker, CircuitError, CircuitState, CircuitStatus};
pub use civil::{CivilClock, DayBounds, parse_slot};
pub use collaborators::{
    ChangeStream, CollabResult, ContentGenerator, Notifier, NotifyEvent, Publisher, Store,
};
pub use config::{
    CircuitBreakerConfig, MonitorConfig, QueueConfig, RateLimit, RateLimitConfig, RetryPolicy,
    SchedulerConfig,
};
pub use error::{CollaboratorError, Result, SchedulerError};
pub use listener::{ChangeListener, FeedMode};
pub use memory::InMemoryStore;
pub use monitor::{
    BucketInterval, HealthCheck, HealthReport, HealthStatus, MetricBucket, MetricPoint,
    RecentActivity, SchedulerMonitor, StatusSummary,
};
pub use queue::{JobEvent, JobHandler, JobQueue, select_batch};
pub use rate_limit::{RateLimitDecision, RateLimitStats, RateLimiter};
pub use scheduler::{
    EmergencyStopReport, GenerationFailure, GenerationReport, HealthSnapshot, PublishOutcome,
    Scheduler, SchedulerDeps, SchedulerStatus, WindowKind, WindowStatus,
};
pub use types::{
    ChangeEvent, ChangeRecord, GeneratedContent, Job, JobKind, JobPriority, JobRef, JobStats,
    JobStatus, NewJob, NewPost, Post, PostStatus, Schedule,
};
