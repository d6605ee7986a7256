//! Interfaces to the services the scheduler drives but does not own.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures_util::stream::BoxStream;
use serde::Serialize;
use tracing::{Instrument, warn};

use crate::civil::DayBounds;
use crate::error::CollaboratorError;
use crate::types::{ChangeRecord, GeneratedContent, JobKind, NewPost, Post, Schedule};

pub type CollabResult<T> = std::result::Result<T, CollaboratorError>;

/// Live feed of store changes.
pub type ChangeStream = BoxStream<'static, ChangeRecord>;

/// Persistent source of truth for schedules and posts.
#[async_trait]
pub trait Store: Send + Sync {
    async fn list_active_schedules(&self, user_id: &str) -> CollabResult<Vec<Schedule>>;

    /// Whether any post for `(user_id, platform)` was created inside `bounds`.
    async fn has_content_today(
        &self,
        user_id: &str,
        platform: &str,
        bounds: DayBounds,
    ) -> CollabResult<bool>;

    /// Posts still waiting to be published.
    async fn list_pending_posts(&self, user_id: &str) -> CollabResult<Vec<Post>>;

    /// Insert a post in `Scheduled` status.
    ///
    /// Fails with [`CollaboratorError::Conflict`] when a post for the same
    /// user, platform and publish time already exists.
    async fn insert_scheduled_post(&self, post: NewPost) -> CollabResult<Post>;

    /// Store content for manual handling.
    async fn save_draft(
        &self,
        user_id: &str,
        platform: &str,
        content: &GeneratedContent,
        now: DateTime<Utc>,
    ) -> CollabResult<Post>;

    /// Move an existing post to `Draft`.
    async fn mark_draft(&self, post_id: &str) -> CollabResult<()>;

    async fn mark_posted(&self, post_id: &str, remote_id: &str) -> CollabResult<()>;

    async fn get_post(&self, post_id: &str) -> CollabResult<Option<Post>>;

    /// Cheap reachability check.
    async fn ping(&self) -> CollabResult<()>;

    /// Open a push subscription to changes. May fail; callers fall back to
    /// [`changes_since`](Store::changes_since).
    async fn subscribe_changes(&self) -> CollabResult<ChangeStream>;

    /// Changes after `cursor`, with the cursor to pass next time.
    async fn changes_since(&self, cursor: u64) -> CollabResult<(Vec<ChangeRecord>, u64)>;

    /// Position of the latest change.
    async fn current_cursor(&self) -> CollabResult<u64>;
}

/// Turns a topic into publishable content.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, platform: &str, topic: &str) -> CollabResult<GeneratedContent>;
}

/// Publishes content to a platform, returning the remote post id.
#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(&self, platform: &str, content: &GeneratedContent) -> CollabResult<String>;
}

/// Something the user should hear about.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NotifyEvent {
    ContentGenerated {
        platform: String,
        post_id: String,
        scheduled_for: DateTime<Utc>,
    },
    PostPublished {
        platform: String,
        post_id: Option<String>,
        remote_id: String,
    },
    /// Publishing was skipped; the content was kept as a draft.
    PostDeferred {
        platform: String,
        post_id: Option<String>,
        reason: String,
    },
    JobFailed {
        job_id: String,
        kind: JobKind,
        error: String,
    },
    AnalyticsWindow {
        user_id: String,
        date: NaiveDate,
    },
    EmergencyStop {
        drained: bool,
        in_flight: usize,
    },
}

/// User-facing notification sink.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, event: NotifyEvent) -> CollabResult<()>;
}

/// Deliver `event` on a background task. Failures are logged and dropped.
pub fn notify_detached(notifier: &Arc<dyn Notifier>, event: NotifyEvent) {
    let notifier = Arc::clone(notifier);
    let span = tracing::debug_span!("notify");
    tokio::spawn(
        async move {
            if let Err(e) = notifier.notify(event).await {
                warn!(error = %e, "notification failed");
            }
        }
        .instrument(span),
    );
}
