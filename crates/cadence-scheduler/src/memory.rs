//! In-memory [`Store`] used by the host binary and tests.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tokio::sync::{RwLock, broadcast};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, trace};

use crate::civil::DayBounds;
use crate::collaborators::{ChangeStream, CollabResult, Store};
use crate::error::CollaboratorError;
use crate::types::{
    ChangeEvent, ChangeRecord, GeneratedContent, NewPost, Post, PostStatus, Schedule,
};

/// Broadcast channel capacity for change notifications.
const CHANGE_CHANNEL_CAPACITY: usize = 1024;

struct State {
    schedules: HashMap<(String, String), Schedule>,
    posts: Vec<Post>,
    log: Vec<ChangeRecord>,
    changes_tx: broadcast::Sender<ChangeRecord>,
}

impl State {
    fn record(&mut self, event: ChangeEvent) {
        let record = ChangeRecord {
            seq: self.log.len() as u64 + 1,
            event,
        };
        self.log.push(record.clone());
        if self.changes_tx.send(record).is_err() {
            trace!("no subscribers for store change");
        }
    }

    fn post_mut(&mut self, post_id: &str) -> CollabResult<&mut Post> {
        self.posts
            .iter_mut()
            .find(|p| p.id == post_id)
            .ok_or_else(|| CollaboratorError::Validation(format!("post not found: {post_id}")))
    }
}

/// Process-local store with a change log and push notifications.
pub struct InMemoryStore {
    state: RwLock<State>,
    subscriptions_available: AtomicBool,
    reachable: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (changes_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(State {
                schedules: HashMap::new(),
                posts: Vec::new(),
                log: Vec::new(),
                changes_tx,
            }),
            subscriptions_available: AtomicBool::new(true),
            reachable: AtomicBool::new(true),
        }
    }

    /// Create or replace the schedule for its `(user_id, platform)`.
    pub async fn upsert_schedule(&self, schedule: Schedule) {
        let mut state = self.state.write().await;
        let key = (schedule.user_id.clone(), schedule.platform.clone());
        debug!(user_id = %key.0, platform = %key.1, "schedule upserted");
        state.schedules.insert(key, schedule.clone());
        state.record(ChangeEvent::ScheduleUpserted(schedule));
    }

    /// Snapshot of every stored post, oldest first.
    pub async fn posts(&self) -> Vec<Post> {
        self.state.read().await.posts.clone()
    }

    /// Make new subscriptions fail, forcing callers onto polling.
    pub fn set_subscriptions_available(&self, available: bool) {
        self.subscriptions_available
            .store(available, Ordering::SeqCst);
    }

    /// End every open change stream.
    pub async fn disconnect_subscribers(&self) {
        let (changes_tx, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        self.state.write().await.changes_tx = changes_tx;
    }

    /// Make [`ping`](Store::ping) fail.
    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn list_active_schedules(&self, user_id: &str) -> CollabResult<Vec<Schedule>> {
        let state = self.state.read().await;
        let mut schedules: Vec<Schedule> = state
            .schedules
            .values()
            .filter(|s| s.user_id == user_id && s.is_active)
            .cloned()
            .collect();
        schedules.sort_by(|a, b| a.platform.cmp(&b.platform));
        Ok(schedules)
    }

    async fn has_content_today(
        &self,
        user_id: &str,
        platform: &str,
        bounds: DayBounds,
    ) -> CollabResult<bool> {
        let state = self.state.read().await;
        Ok(state.posts.iter().any(|p| {
            p.user_id == user_id && p.platform == platform && bounds.contains(p.created_at)
        }))
    }

    async fn list_pending_posts(&self, user_id: &str) -> CollabResult<Vec<Post>> {
        let state = self.state.read().await;
        Ok(state
            .posts
            .iter()
            .filter(|p| p.user_id == user_id && p.status == PostStatus::Scheduled)
            .cloned()
            .collect())
    }

    async fn insert_scheduled_post(&self, post: NewPost) -> CollabResult<Post> {
        let mut state = self.state.write().await;
        let duplicate = state.posts.iter().any(|p| {
            p.user_id == post.user_id
                && p.platform == post.platform
                && p.scheduled_for == post.scheduled_for
                && p.status != PostStatus::Draft
        });
        if duplicate {
            return Err(CollaboratorError::Conflict(format!(
                "post already scheduled for {} at {}",
                post.platform, post.scheduled_for
            )));
        }

        let post = Post {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: post.user_id,
            platform: post.platform,
            content: post.content,
            scheduled_for: post.scheduled_for,
            status: PostStatus::Scheduled,
            remote_id: None,
            created_at: post.created_at,
        };
        state.posts.push(post.clone());
        state.record(ChangeEvent::PostInserted(post.clone()));
        Ok(post)
    }

    async fn save_draft(
        &self,
        user_id: &str,
        platform: &str,
        content: &GeneratedContent,
        now: DateTime<Utc>,
    ) -> CollabResult<Post> {
        let mut state = self.state.write().await;
        let post = Post {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            platform: platform.to_string(),
            content: content.clone(),
            scheduled_for: now,
            status: PostStatus::Draft,
            remote_id: None,
            created_at: now,
        };
        state.posts.push(post.clone());
        state.record(ChangeEvent::PostInserted(post.clone()));
        Ok(post)
    }

    async fn mark_draft(&self, post_id: &str) -> CollabResult<()> {
        let mut state = self.state.write().await;
        state.post_mut(post_id)?.status = PostStatus::Draft;
        Ok(())
    }

    async fn mark_posted(&self, post_id: &str, remote_id: &str) -> CollabResult<()> {
        let mut state = self.state.write().await;
        let post = state.post_mut(post_id)?;
        post.status = PostStatus::Posted;
        post.remote_id = Some(remote_id.to_string());
        Ok(())
    }

    async fn get_post(&self, post_id: &str) -> CollabResult<Option<Post>> {
        let state = self.state.read().await;
        Ok(state.posts.iter().find(|p| p.id == post_id).cloned())
    }

    async fn ping(&self) -> CollabResult<()> {
        if self.reachable.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(CollaboratorError::Transient("store unreachable".to_string()))
        }
    }

    async fn subscribe_changes(&self) -> CollabResult<ChangeStream> {
        if !self.subscriptions_available.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Transient(
                "change subscriptions unavailable".to_string(),
            ));
        }
        let rx = self.state.read().await.changes_tx.subscribe();
        Ok(BroadcastStream::new(rx)
            .filter_map(|item| std::future::ready(item.ok()))
            .boxed())
    }

    async fn changes_since(&self, cursor: u64) -> CollabResult<(Vec<ChangeRecord>, u64)> {
        let state = self.state.read().await;
        let changes: Vec<ChangeRecord> = state
            .log
            .iter()
            .filter(|r| r.seq > cursor)
            .cloned()
            .collect();
        let next = changes.last().map_or(cursor, |r| r.seq);
        Ok((changes, next))
    }

    async fn current_cursor(&self) -> CollabResult<u64> {
        Ok(self.state.read().await.log.len() as u64)
    }
}
