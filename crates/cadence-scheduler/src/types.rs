//! Scheduler types.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::config::RetryPolicy;

/// What a job does. Dispatch looks up the handler registered for the kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Generate content for one platform's schedule.
    ContentGeneration,
    /// Publish one stored post.
    ContentPosting,
    /// Rebuild queued work from the store.
    ScheduleSync,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobKind::ContentGeneration => "content_generation",
            JobKind::ContentPosting => "content_posting",
            JobKind::ScheduleSync => "schedule_sync",
        };
        write!(f, "{s}")
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "content_generation" => Ok(JobKind::ContentGeneration),
            "content_posting" => Ok(JobKind::ContentPosting),
            "schedule_sync" => Ok(JobKind::ScheduleSync),
            other => Err(format!("unknown job kind: {other}")),
        }
    }
}

/// Dispatch priority. Declaration order gives `Low < Medium < High`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum JobPriority {
    Low,
    #[default]
    Medium,
    High,
}

/// Current status of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for its scheduled time.
    #[default]
    Pending,
    /// Claimed by a dispatch tick and executing.
    Processing,
    /// Finished successfully.
    Completed,
    /// Failed permanently. Never retried automatically.
    Failed,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A queued unit of work.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// UUID v4.
    pub id: String,
    pub kind: JobKind,
    pub priority: JobPriority,
    /// Handler-specific JSON payload.
    pub payload: serde_json::Value,
    /// Not-before instant. Never moves backwards across retries.
    pub scheduled_time: DateTime<Utc>,
    pub retry_count: u32,
    pub max_retries: u32,
    pub status: JobStatus,
    pub user_id: String,
    pub platform: Option<String>,
    /// Jobs sharing a key are collapsed while one of them is not terminal.
    pub dedupe_key: Option<String>,
    pub last_error: Option<String>,
    /// Delay applied before the most recent retry, in milliseconds.
    pub last_backoff_ms: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    /// Materialise a job from a request.
    pub fn from_new(new: NewJob, default_max_retries: u32, now: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            kind: new.kind,
            priority: new.priority,
            payload: new.payload,
            scheduled_time: new.scheduled_time.unwrap_or(now),
            retry_count: 0,
            max_retries: new.max_retries.unwrap_or(default_max_retries),
            status: JobStatus::Pending,
            user_id: new.user_id,
            platform: new.platform,
            dedupe_key: new.dedupe_key,
            last_error: None,
            last_backoff_ms: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Check if this job is due to run.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.scheduled_time <= now
    }

    /// Delay before the next attempt, never shorter than the previous one.
    ///
    /// `hint_secs` is a server-supplied retry-after; it replaces the computed
    /// exponential delay. `jitter_fraction` must be in `[0, 1)`.
    pub fn next_retry_delay_ms(
        &self,
        policy: &RetryPolicy,
        hint_secs: Option<u64>,
        jitter_fraction: f64,
    ) -> u64 {
        let computed = match hint_secs {
            Some(secs) => secs.saturating_mul(1000),
            None => policy.delay_ms(self.retry_count, jitter_fraction),
        };
        computed.max(self.last_backoff_ms)
    }

    pub fn job_ref(&self) -> JobRef {
        JobRef {
            id: self.id.clone(),
            kind: self.kind,
            platform: self.platform.clone(),
        }
    }
}

/// Request to enqueue a job.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub kind: JobKind,
    pub user_id: String,
    pub priority: JobPriority,
    pub payload: serde_json::Value,
    pub platform: Option<String>,
    pub scheduled_time: Option<DateTime<Utc>>,
    pub max_retries: Option<u32>,
    pub dedupe_key: Option<String>,
}

impl NewJob {
    pub fn new(kind: JobKind, user_id: impl Into<String>) -> Self {
        Self {
            kind,
            user_id: user_id.into(),
            priority: JobPriority::default(),
            payload: serde_json::Value::Null,
            platform: None,
            scheduled_time: None,
            max_retries: None,
            dedupe_key: None,
        }
    }

    pub fn priority(mut self, priority: JobPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn platform(mut self, platform: impl Into<String>) -> Self {
        self.platform = Some(platform.into());
        self
    }

    /// Run no earlier than `at`. Defaults to now.
    pub fn at(mut self, at: DateTime<Utc>) -> Self {
        self.scheduled_time = Some(at);
        self
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn dedupe_key(mut self, key: impl Into<String>) -> Self {
        self.dedupe_key = Some(key.into());
        self
    }
}

/// Lightweight job identity carried by lifecycle events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRef {
    pub id: String,
    pub kind: JobKind,
    pub platform: Option<String>,
}

/// Job counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStats {
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub total: usize,
}

/// Per-user, per-platform posting plan. Read-only to the scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schedule {
    pub user_id: String,
    pub platform: String,
    pub max_posts_per_day: u32,
    /// Wall-clock "HH:MM" strings in the configured civil timezone.
    pub preferred_times: Vec<String>,
    /// Weekday indices, 0 = Sunday.
    pub days_of_week: Vec<u8>,
    pub is_active: bool,
}

impl Schedule {
    pub fn runs_on(&self, weekday: u8) -> bool {
        self.days_of_week.contains(&weekday)
    }

    /// Number of posts one day of this schedule produces.
    pub fn slot_count(&self) -> usize {
        (self.max_posts_per_day as usize).min(self.preferred_times.len())
    }
}

/// Output of the content generator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedContent {
    pub title: String,
    pub body: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    /// Waiting for its publish time.
    Scheduled,
    /// Published; `remote_id` is set.
    Posted,
    /// Saved for manual handling.
    Draft,
    Failed,
}

/// A stored content row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Post {
    pub id: String,
    pub user_id: String,
    pub platform: String,
    pub content: GeneratedContent,
    pub scheduled_for: DateTime<Utc>,
    pub status: PostStatus,
    pub remote_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// A post to be inserted by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPost {
    pub user_id: String,
    pub platform: String,
    pub content: GeneratedContent,
    pub scheduled_for: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Live configuration change published by the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    /// A schedule was created or updated.
    ScheduleUpserted(Schedule),
    /// A content row was inserted.
    PostInserted(Post),
}

/// A change event with its position in the store's change log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeRecord {
    pub seq: u64,
    pub event: ChangeEvent,
}
