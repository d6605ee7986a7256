//! Job handlers registered by the scheduler.
//!
//! Handlers hold a weak reference back to the scheduler so the queue does
//! not keep it alive.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use chrono::Utc;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use crate::collaborators::{NotifyEvent, Store, notify_detached};
use crate::error::{CollaboratorError, Result, SchedulerError};
use crate::queue::JobHandler;
use crate::scheduler::{GenerationReport, PublishOutcome, SchedulerInner};
use crate::types::{Job, PostStatus};

#[derive(Debug, Deserialize)]
struct GenerationPayload {
    platform: String,
}

#[derive(Debug, Deserialize)]
struct PostingPayload {
    post_id: String,
}

fn decode<T: DeserializeOwned>(job: &Job) -> Result<T> {
    serde_json::from_value(job.payload.clone()).map_err(|e| SchedulerError::InvalidPayload {
        kind: job.kind,
        message: e.to_string(),
    })
}

fn upgrade(inner: &Weak<SchedulerInner>) -> Result<Arc<SchedulerInner>> {
    inner.upgrade().ok_or(SchedulerError::NotRunning)
}

/// Mark a published post as posted, retrying transient store failures.
///
/// Never returns a retryable error: the post is already live.
async fn record_posted(store: &Arc<dyn Store>, post_id: &str, remote_id: &str) -> Result<()> {
    let mut backoff = ExponentialBackoff {
        initial_interval: Duration::from_millis(200),
        max_interval: Duration::from_secs(5),
        max_elapsed_time: Some(Duration::from_secs(30)),
        ..Default::default()
    };

    loop {
        let err = match store.mark_posted(post_id, remote_id).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        let wait = match err {
            CollaboratorError::Transient(_) | CollaboratorError::RateLimited { .. } => {
                backoff.next_backoff()
            }
            _ => None,
        };
        let Some(wait) = wait else {
            return Err(SchedulerError::UnrecordedPublish {
                post_id: post_id.to_string(),
                remote_id: remote_id.to_string(),
                message: err.to_string(),
            });
        };
        warn!(
            post_id,
            remote_id,
            error = %err,
            wait_ms = wait.as_millis() as u64,
            "could not record published post, retrying"
        );
        tokio::time::sleep(wait).await;
    }
}

/// Generates today's content for one platform.
pub(crate) struct GenerationHandler {
    inner: Weak<SchedulerInner>,
}

impl GenerationHandler {
    pub(crate) fn new(inner: Weak<SchedulerInner>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl JobHandler for GenerationHandler {
    async fn handle(&self, job: Job) -> Result<()> {
        let payload: GenerationPayload = decode(&job)?;
        let inner = upgrade(&self.inner)?;

        let schedules = inner.store().list_active_schedules(&job.user_id).await?;
        let Some(schedule) = schedules
            .into_iter()
            .find(|s| s.platform == payload.platform)
        else {
            debug!(platform = %payload.platform, "no active schedule, nothing to generate");
            return Ok(());
        };

        let now = Utc::now();
        let bounds = inner.clock().day_bounds(now);
        let mut report = GenerationReport::default();
        inner
            .generate_for_schedule(&schedule, now, bounds, &mut report)
            .await?;
        info!(
            platform = %schedule.platform,
            created = report.posts_created,
            "generation job finished"
        );
        Ok(())
    }
}

/// Publishes one stored post.
pub(crate) struct PostingHandler {
    inner: Weak<SchedulerInner>,
}

impl PostingHandler {
    pub(crate) fn new(inner: Weak<SchedulerInner>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl JobHandler for PostingHandler {
    async fn handle(&self, job: Job) -> Result<()> {
        let payload: PostingPayload = decode(&job)?;
        let inner = upgrade(&self.inner)?;
        let store = inner.store();

        let Some(post) = store.get_post(&payload.post_id).await? else {
            return Err(CollaboratorError::Validation(format!("post {} not found", payload.post_id)).into());
        };
        if post.status != PostStatus::Scheduled {
            debug!(post_id = %post.id, status = ?post.status, "post no longer scheduled, skipping");
            return Ok(());
        }

        let outcome = inner
            .publish(&post.platform, &post.content, &post.user_id, Some(&post.id))
            .await?;
        match outcome {
            PublishOutcome::Published { remote_id } => {
                record_posted(store, &post.id, &remote_id).await?;
                info!(post_id = %post.id, platform = %post.platform, %remote_id, "post published");
                notify_detached(
                    inner.notifier(),
                    NotifyEvent::PostPublished {
                        platform: post.platform,
                        post_id: Some(post.id),
                        remote_id,
                    },
                );
            }
            PublishOutcome::SavedForLater => {
                notify_detached(
                    inner.notifier(),
                    NotifyEvent::PostDeferred {
                        reason: format!("{} is unavailable, kept as draft", post.platform),
                        platform: post.platform,
                        post_id: Some(post.id),
                    },
                );
            }
        }
        Ok(())
    }
}

/// Re-reads pending posts so none are left without a posting job.
pub(crate) struct SyncHandler {
    inner: Weak<SchedulerInner>,
}

impl SyncHandler {
    pub(crate) fn new(inner: Weak<SchedulerInner>) -> Self {
        Self { inner }
    }
}

#[async_trait]
impl JobHandler for SyncHandler {
    async fn handle(&self, job: Job) -> Result<()> {
        let inner = upgrade(&self.inner)?;
        let count = inner.reseed_from_store().await?;
        info!(job_id = %job.id, user_id = %inner.config().user_id, count, "schedule sync finished");
        Ok(())
    }
}
