//! Shared fakes for the integration tests.

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use tokio::sync::Notify;

use cadence_scheduler::{
    ChangeRecord, ChangeStream, CollabResult, CollaboratorError, ContentGenerator, DayBounds,
    GeneratedContent, InMemoryStore, NewPost, Notifier, NotifyEvent, Post, Publisher, Schedule,
    SchedulerConfig, SchedulerDeps, Store,
};

/// [`InMemoryStore`] with injectable write failures and stalls.
#[derive(Default)]
pub struct FaultyStore {
    pub inner: InMemoryStore,
    /// `mark_posted` calls left to fail.
    pub mark_posted_failures: AtomicUsize,
    pub mark_posted_error: Mutex<Option<CollaboratorError>>,
    /// Make `has_content_today` hang forever.
    pub stall_content_checks: AtomicBool,
    pub stalled: Notify,
}

impl FaultyStore {
    pub fn fail_mark_posted(&self, times: usize, error: CollaboratorError) {
        *self.mark_posted_error.lock().unwrap() = Some(error);
        self.mark_posted_failures.store(times, Ordering::SeqCst);
    }
}

#[async_trait]
impl Store for FaultyStore {
    async fn list_active_schedules(&self, user_id: &str) -> CollabResult<Vec<Schedule>> {
        self.inner.list_active_schedules(user_id).await
    }

    async fn has_content_today(
        &self,
        user_id: &str,
        platform: &str,
        bounds: DayBounds,
    ) -> CollabResult<bool> {
        if self.stall_content_checks.load(Ordering::SeqCst) {
            self.stalled.notify_one();
            std::future::pending::<()>().await;
        }
        self.inner.has_content_today(user_id, platform, bounds).await
    }

    async fn list_pending_posts(&self, user_id: &str) -> CollabResult<Vec<Post>> {
        self.inner.list_pending_posts(user_id).await
    }

    async fn insert_scheduled_post(&self, post: NewPost) -> CollabResult<Post> {
        self.inner.insert_scheduled_post(post).await
    }

    async fn save_draft(
        &self,
        user_id: &str,
        platform: &str,
        content: &GeneratedContent,
        now: DateTime<Utc>,
    ) -> CollabResult<Post> {
        self.inner.save_draft(user_id, platform, content, now).await
    }

    async fn mark_draft(&self, post_id: &str) -> CollabResult<()> {
        self.inner.mark_draft(post_id).await
    }

    async fn mark_posted(&self, post_id: &str, remote_id: &str) -> CollabResult<()> {
        let failing = self
            .mark_posted_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing && let Some(error) = self.mark_posted_error.lock().unwrap().clone() {
            return Err(error);
        }
        self.inner.mark_posted(post_id, remote_id).await
    }

    async fn get_post(&self, post_id: &str) -> CollabResult<Option<Post>> {
        self.inner.get_post(post_id).await
    }

    async fn ping(&self) -> CollabResult<()> {
        self.inner.ping().await
    }

    async fn subscribe_changes(&self) -> CollabResult<ChangeStream> {
        self.inner.subscribe_changes().await
    }

    async fn changes_since(&self, cursor: u64) -> CollabResult<(Vec<ChangeRecord>, u64)> {
        self.inner.changes_since(cursor).await
    }

    async fn current_cursor(&self) -> CollabResult<u64> {
        self.inner.current_cursor().await
    }
}

/// Generator that echoes its inputs and can be told to fail.
#[derive(Default)]
pub struct ScriptedGenerator {
    pub calls: AtomicUsize,
    pub failing: AtomicBool,
}

#[async_trait]
impl ContentGenerator for ScriptedGenerator {
    async fn generate(&self, platform: &str, topic: &str) -> CollabResult<GeneratedContent> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Transient("generator down".to_string()));
        }
        Ok(GeneratedContent {
            title: format!("{topic} for {platform}"),
            body: format!("A short piece about {topic}."),
            tags: vec![topic.to_string()],
        })
    }
}

/// Publisher that counts calls and can be told to fail.
#[derive(Default)]
pub struct CountingPublisher {
    pub calls: AtomicUsize,
    pub failing: AtomicBool,
}

#[async_trait]
impl Publisher for CountingPublisher {
    async fn publish(&self, platform: &str, _content: &GeneratedContent) -> CollabResult<String> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.failing.load(Ordering::SeqCst) {
            return Err(CollaboratorError::Transient(format!("{platform} unavailable")));
        }
        Ok(format!("{platform}-{n}"))
    }
}

/// Notifier that keeps every event.
#[derive(Default)]
pub struct RecordingNotifier {
    pub events: Mutex<Vec<NotifyEvent>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<NotifyEvent> {
        self.events.lock().unwrap().clone()
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, event: NotifyEvent) -> CollabResult<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

pub struct Fakes {
    pub store: Arc<InMemoryStore>,
    pub generator: Arc<ScriptedGenerator>,
    pub publisher: Arc<CountingPublisher>,
    pub notifier: Arc<RecordingNotifier>,
}

impl Fakes {
    pub fn new() -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            generator: Arc::new(ScriptedGenerator::default()),
            publisher: Arc::new(CountingPublisher::default()),
            notifier: Arc::new(RecordingNotifier::default()),
        }
    }

    pub fn deps(&self) -> SchedulerDeps {
        self.deps_with_store(self.store.clone())
    }

    pub fn deps_with_store(&self, store: Arc<dyn Store>) -> SchedulerDeps {
        SchedulerDeps {
            store,
            generator: self.generator.clone(),
            publisher: self.publisher.clone(),
            notifier: self.notifier.clone(),
        }
    }
}

/// Defaults for user "alice" in UTC+5:30.
pub fn config() -> SchedulerConfig {
    SchedulerConfig {
        user_id: "alice".to_string(),
        ..SchedulerConfig::default()
    }
}

pub fn schedule(platform: &str, times: &[&str], max_posts: u32, days: &[u8]) -> Schedule {
    Schedule {
        user_id: "alice".to_string(),
        platform: platform.to_string(),
        max_posts_per_day: max_posts,
        preferred_times: times.iter().map(|t| t.to_string()).collect(),
        days_of_week: days.to_vec(),
        is_active: true,
    }
}

pub fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

/// Let detached tasks such as notifications run.
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}
