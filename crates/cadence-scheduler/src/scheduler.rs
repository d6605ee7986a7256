//! Scheduler orchestrator.
//!
//! Owns the queue, breaker, limiter, monitor and change listener, and drives
//! them from two daily civil-time windows: content generation (midnight) and
//! analytics (23:00). Everything the orchestrator creates goes through the
//! job queue, which it rebuilds from the store on every start.

use std::sync::Arc;

use chrono::{DateTime, NaiveDate, Utc};
use rand::Rng;
use rand::seq::IndexedRandom;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::circuit::{CircuitBreaker, CircuitStatus};
use crate::civil::{CivilClock, DayBounds, parse_slot};
use crate::collaborators::{
    ContentGenerator, Notifier, NotifyEvent, Publisher, Store, notify_detached,
};
use crate::config::SchedulerConfig;
use crate::error::{CollaboratorError, Result, SchedulerError};
use crate::handlers::{GenerationHandler, PostingHandler, SyncHandler};
use crate::listener::{ChangeListener, FeedMode};
use crate::monitor::{HealthReport, SchedulerMonitor, StatusSummary};
use crate::queue::{JobEvent, JobQueue};
use crate::rate_limit::{RateLimitStats, RateLimiter};
use crate::types::{
    ChangeEvent, GeneratedContent, Job, JobKind, JobPriority, JobStats, JobStatus, NewJob,
    NewPost, Post, PostStatus, Schedule,
};

/// Capacity of the channel between the change listener and the reactor.
const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// External services the scheduler drives.
#[derive(Clone)]
pub struct SchedulerDeps {
    pub store: Arc<dyn Store>,
    pub generator: Arc<dyn ContentGenerator>,
    pub publisher: Arc<dyn Publisher>,
    pub notifier: Arc<dyn Notifier>,
}

/// The two daily trigger windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowKind {
    Content,
    Analytics,
}

#[derive(Debug, Clone)]
struct DailyWindow {
    kind: WindowKind,
    hour: u32,
    next_fire: Option<DateTime<Utc>>,
    last_run: Option<NaiveDate>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WindowStatus {
    pub kind: WindowKind,
    pub armed: bool,
    pub next_fire: Option<DateTime<Utc>>,
    /// Civil date of the last execution.
    pub last_run: Option<NaiveDate>,
}

/// Result of a generate-content pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GenerationReport {
    pub posts_created: usize,
    /// Platforms that already had content for the civil day.
    pub skipped_platforms: Vec<String>,
    pub failures: Vec<GenerationFailure>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationFailure {
    pub platform: String,
    pub slot: Option<String>,
    pub error: String,
}

/// What happened to a publish request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum PublishOutcome {
    Published { remote_id: String },
    /// The platform's circuit is open; the content was kept as a draft.
    SavedForLater,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SchedulerStatus {
    pub running: bool,
    pub change_feed: FeedMode,
    pub windows: Vec<WindowStatus>,
    pub summary: StatusSummary,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthSnapshot {
    pub report: HealthReport,
    pub queue: JobStats,
    pub circuits: Vec<CircuitStatus>,
    pub rate_limits: RateLimitStats,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EmergencyStopReport {
    /// Every in-flight job finished before the timeout.
    pub drained: bool,
    pub in_flight: usize,
}

struct Runtime {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub(crate) struct SchedulerInner {
    config: SchedulerConfig,
    clock: CivilClock,
    deps: SchedulerDeps,
    queue: Arc<JobQueue>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    monitor: Arc<SchedulerMonitor>,
    listener: Arc<ChangeListener>,
    windows: RwLock<Vec<DailyWindow>>,
    runtime: Mutex<Option<Runtime>>,
}

/// Autonomous content scheduler.
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig, deps: SchedulerDeps) -> Result<Self> {
        config.validate()?;
        let clock = CivilClock::new(config.utc_offset_minutes)?;

        let queue = JobQueue::new(config.queue.clone(), config.retry.clone());
        let breaker = Arc::new(CircuitBreaker::new(config.circuit_breaker.clone()));
        let limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let monitor = SchedulerMonitor::new(
            config.monitor.clone(),
            Arc::clone(&queue),
            Arc::clone(&breaker),
            Arc::clone(&limiter),
            Arc::clone(&deps.store),
        );
        let listener = Arc::new(ChangeListener::new(
            Arc::clone(&deps.store),
            config.poll_interval(),
        ));
        let windows = vec![
            DailyWindow {
                kind: WindowKind::Content,
                hour: config.content_hour,
                next_fire: None,
                last_run: None,
            },
            DailyWindow {
                kind: WindowKind::Analytics,
                hour: config.analytics_hour,
                next_fire: None,
                last_run: None,
            },
        ];

        let inner = Arc::new(SchedulerInner {
            config,
            clock,
            deps,
            queue,
            breaker,
            limiter,
            monitor,
            listener,
            windows: RwLock::new(windows),
            runtime: Mutex::new(None),
        });

        let weak = Arc::downgrade(&inner);
        inner.queue.register(
            JobKind::ContentGeneration,
            Arc::new(GenerationHandler::new(weak.clone())),
        );
        inner
            .queue
            .register(JobKind::ContentPosting, Arc::new(PostingHandler::new(weak.clone())));
        inner
            .queue
            .register(JobKind::ScheduleSync, Arc::new(SyncHandler::new(weak)));

        Ok(Self { inner })
    }

    /// Bring every component up and run the startup pass. No-op if running.
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) {
        let inner = &self.inner;
        let shutdown_rx = {
            let mut runtime = inner.runtime.lock().await;
            if runtime.is_some() {
                debug!("scheduler already running");
                return;
            }
            info!(user_id = %inner.config.user_id, "scheduler starting");

            // Read before the startup pass so later changes are never skipped.
            let cursor = inner.listener.start_cursor().await;
            inner.queue.start().await;
            inner.monitor.start().await;

            let (shutdown_tx, shutdown_rx) = watch::channel(false);
            let (change_tx, change_rx) = mpsc::channel(CHANGE_CHANNEL_CAPACITY);
            let mut handles = Vec::with_capacity(4);

            handles.push({
                let listener = Arc::clone(&inner.listener);
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move { listener.run(cursor, change_tx, shutdown_rx).await })
            });
            handles.push({
                let inner = Arc::clone(inner);
                tokio::spawn(async move { inner.react_to_changes(change_rx).await })
            });
            handles.push({
                let inner = Arc::clone(inner);
                let events = inner.queue.subscribe();
                let shutdown_rx = shutdown_rx.clone();
                tokio::spawn(async move { inner.relay_failures(events, shutdown_rx).await })
            });

            *runtime = Some(Runtime {
                shutdown_tx,
                handles,
            });
            shutdown_rx
        };

        let now = Utc::now();
        match inner.reseed_from_store().await {
            Ok(count) => info!(count, "re-seeded posting jobs from store"),
            Err(e) => error!(error = %e, "failed to re-seed jobs from store"),
        }

        inner.mark_window_run(WindowKind::Content, now).await;
        match inner.generate_content_for(now).await {
            Ok(report) => info!(
                created = report.posts_created,
                skipped = report.skipped_platforms.len(),
                failures = report.failures.len(),
                "startup content pass finished"
            ),
            Err(e) => error!(error = %e, "startup content pass failed"),
        }

        let mut runtime = inner.runtime.lock().await;
        let stopped = *shutdown_rx.borrow();
        match runtime.as_mut() {
            Some(runtime) if !stopped => {
                inner.arm_windows(now).await;
                let inner = Arc::clone(inner);
                runtime
                    .handles
                    .push(tokio::spawn(async move { inner.run_triggers(shutdown_rx).await }));
                info!("scheduler started");
            }
            _ => debug!("scheduler stopped during startup"),
        }
    }

    /// Stop every background task. No-op if stopped.
    ///
    /// Tasks that do not finish within the drain timeout are aborted.
    #[tracing::instrument(skip(self))]
    pub async fn stop(&self) {
        let deadline = Instant::now() + self.inner.config.emergency_drain_timeout();
        self.inner.shutdown(deadline).await;
    }

    /// Stop taking new work and wait, bounded, for running jobs to finish.
    #[tracing::instrument(skip(self))]
    pub async fn emergency_stop(&self) -> EmergencyStopReport {
        warn!("emergency stop requested");
        let deadline = Instant::now() + self.inner.config.emergency_drain_timeout();
        self.inner.shutdown(deadline).await;

        let drained = self
            .inner
            .queue
            .wait_idle(deadline.saturating_duration_since(Instant::now()))
            .await;
        let report = EmergencyStopReport {
            drained,
            in_flight: self.inner.queue.in_flight(),
        };
        if !drained {
            warn!(in_flight = report.in_flight, "jobs still running after drain timeout");
        }
        notify_detached(
            &self.inner.deps.notifier,
            NotifyEvent::EmergencyStop {
                drained,
                in_flight: report.in_flight,
            },
        );
        report
    }

    pub async fn is_running(&self) -> bool {
        self.inner.runtime.lock().await.is_some()
    }

    /// Generate today's content now, ignoring the window guard.
    pub async fn force_generate_today(&self) -> Result<GenerationReport> {
        self.generate_content_for(Utc::now()).await
    }

    /// Run the generate pass for the civil day containing `now`.
    pub async fn generate_content_for(&self, now: DateTime<Utc>) -> Result<GenerationReport> {
        self.inner.generate_content_for(now).await
    }

    /// Fire every armed window whose time has come. Returns the windows that ran.
    pub async fn run_due_triggers(&self, now: DateTime<Utc>) -> Vec<WindowKind> {
        self.inner.run_due_triggers(now).await
    }

    /// React to one store change as the live listener would.
    pub async fn handle_change(&self, event: ChangeEvent, now: DateTime<Utc>) -> Result<()> {
        self.inner.handle_change(event, now).await
    }

    /// Enqueue posting jobs for every pending post in the store.
    pub async fn reseed_from_store(&self) -> Result<usize> {
        self.inner.reseed_from_store().await
    }

    /// Publish `content` for `user_id`, keeping it as a draft while the
    /// platform's circuit is open.
    pub async fn post_content(
        &self,
        platform: &str,
        content: &GeneratedContent,
        user_id: &str,
    ) -> Result<PublishOutcome> {
        self.inner.publish(platform, content, user_id, None).await
    }

    pub async fn status(&self) -> SchedulerStatus {
        SchedulerStatus {
            running: self.is_running().await,
            change_feed: self.inner.listener.mode(),
            windows: self.inner.window_status().await,
            summary: self.inner.monitor.status_summary().await,
        }
    }

    /// Fresh health checks plus direct component snapshots.
    pub async fn health_status(&self) -> HealthSnapshot {
        HealthSnapshot {
            report: self.inner.monitor.run_health_checks(Utc::now()).await,
            queue: self.inner.queue.stats().await,
            circuits: self.inner.breaker.all_status(),
            rate_limits: self.inner.limiter.stats(),
        }
    }

    pub async fn queue_stats(&self) -> JobStats {
        self.inner.queue.stats().await
    }

    pub async fn jobs_by_status(&self, status: JobStatus) -> Vec<Job> {
        self.inner.queue.jobs_by_status(status).await
    }

    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.inner.queue
    }

    pub fn breaker(&self) -> &Arc<CircuitBreaker> {
        &self.inner.breaker
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.inner.limiter
    }

    pub fn monitor(&self) -> &Arc<SchedulerMonitor> {
        &self.inner.monitor
    }

    pub fn clock(&self) -> CivilClock {
        self.inner.clock
    }
}

impl SchedulerInner {
    // === Lifecycle ===

    async fn shutdown(&self, deadline: Instant) {
        let Some(runtime) = self.runtime.lock().await.take() else {
            debug!("scheduler already stopped");
            return;
        };

        if runtime.shutdown_tx.send(true).is_err() {
            debug!("scheduler tasks already gone");
        }
        for mut handle in runtime.handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "scheduler task ended abnormally"),
                Err(_) => {
                    warn!("scheduler task did not stop in time, aborting");
                    handle.abort();
                }
            }
        }
        self.queue.stop().await;
        if tokio::time::timeout_at(deadline, self.monitor.stop())
            .await
            .is_err()
        {
            warn!("monitor did not stop in time");
        }

        for window in self.windows.write().await.iter_mut() {
            window.next_fire = None;
        }
        info!("scheduler stopped");
    }

    // === Background tasks ===

    async fn react_to_changes(&self, mut rx: mpsc::Receiver<ChangeEvent>) {
        while let Some(event) = rx.recv().await {
            if let Err(e) = self.handle_change(event, Utc::now()).await {
                warn!(error = %e, "failed to handle store change");
            }
        }
        debug!("change reactor stopped");
    }

    async fn relay_failures(
        &self,
        mut events: broadcast::Receiver<JobEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                event = events.recv() => match event {
                    Ok(JobEvent::Failed { job, error }) => notify_detached(
                        &self.deps.notifier,
                        NotifyEvent::JobFailed {
                            job_id: job.id,
                            kind: job.kind,
                            error,
                        },
                    ),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "failure relay lagged behind job events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn run_triggers(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut trigger_tick = tokio::time::interval(self.config.trigger_check_interval());
        trigger_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let cleanup_period = self.config.cleanup_interval();
        let mut cleanup_tick =
            tokio::time::interval_at(Instant::now() + cleanup_period, cleanup_period);
        cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = trigger_tick.tick() => {
                    self.run_due_triggers(Utc::now()).await;
                }
                _ = cleanup_tick.tick() => {
                    let jobs = self.queue.cleanup(Utc::now()).await;
                    let windows = self.limiter.cleanup();
                    debug!(jobs, windows, "periodic cleanup");
                }
            }
        }
        debug!("trigger loop stopped");
    }

    // === Daily windows ===

    fn next_fire(&self, hour: u32, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let jitter = rand::rng().random_range(0..self.config.trigger_jitter_minutes);
        self.clock.daily_trigger(now, hour, jitter)
    }

    async fn arm_windows(&self, now: DateTime<Utc>) {
        let mut windows = self.windows.write().await;
        for window in windows.iter_mut() {
            match self.next_fire(window.hour, now) {
                Ok(at) => {
                    info!(window = ?window.kind, next_fire = %at, "window armed");
                    window.next_fire = Some(at);
                }
                Err(e) => error!(window = ?window.kind, error = %e, "could not arm window"),
            }
        }
    }

    async fn mark_window_run(&self, kind: WindowKind, now: DateTime<Utc>) {
        let date = self.clock.civil_date(now);
        if let Some(window) = self.windows.write().await.iter_mut().find(|w| w.kind == kind) {
            window.last_run = Some(date);
        }
    }

    async fn run_due_triggers(&self, now: DateTime<Utc>) -> Vec<WindowKind> {
        let date = self.clock.civil_date(now);
        let due: Vec<WindowKind> = {
            let mut windows = self.windows.write().await;
            let mut due = Vec::new();
            for window in windows.iter_mut() {
                let Some(at) = window.next_fire else {
                    continue;
                };
                if at > now {
                    continue;
                }

                if window.last_run == Some(date) {
                    debug!(window = ?window.kind, %date, "window already ran today");
                } else {
                    window.last_run = Some(date);
                    due.push(window.kind);
                }
                match self.next_fire(window.hour, now) {
                    Ok(next) => window.next_fire = Some(next),
                    Err(e) => {
                        error!(window = ?window.kind, error = %e, "could not re-arm window");
                        window.next_fire = None;
                    }
                }
            }
            due
        };

        for kind in &due {
            info!(window = ?kind, %date, "window firing");
            let result = match kind {
                WindowKind::Content => self.generate_content_for(now).await.map(|_| ()),
                WindowKind::Analytics => self.run_analytics_window(now).await,
            };
            if let Err(e) = result {
                error!(window = ?kind, error = %e, "window action failed");
            }
        }
        due
    }

    async fn window_status(&self) -> Vec<WindowStatus> {
        self.windows
            .read()
            .await
            .iter()
            .map(|w| WindowStatus {
                kind: w.kind,
                armed: w.next_fire.is_some(),
                next_fire: w.next_fire,
                last_run: w.last_run,
            })
            .collect()
    }

    async fn run_analytics_window(&self, now: DateTime<Utc>) -> Result<()> {
        let date = self.clock.civil_date(now);
        self.queue
            .add_job(
                NewJob::new(JobKind::ScheduleSync, &self.config.user_id)
                    .priority(JobPriority::Low)
                    .dedupe_key(format!("sync:{date}")),
            )
            .await;
        notify_detached(
            &self.deps.notifier,
            NotifyEvent::AnalyticsWindow {
                user_id: self.config.user_id.clone(),
                date,
            },
        );
        Ok(())
    }

    // === Content generation ===

    #[tracing::instrument(skip(self))]
    pub(crate) async fn generate_content_for(&self, now: DateTime<Utc>) -> Result<GenerationReport> {
        let schedules = self
            .deps
            .store
            .list_active_schedules(&self.config.user_id)
            .await?;
        let weekday = self.clock.weekday_index(now);
        let bounds = self.clock.day_bounds(now);

        let mut report = GenerationReport::default();
        for schedule in schedules.iter().filter(|s| s.runs_on(weekday)) {
            let recorded = report.failures.len();
            let result = self
                .generate_for_schedule(schedule, now, bounds, &mut report)
                .await;
            // Slot failures are already in the report.
            if let Err(e) = result
                && report.failures.len() == recorded
            {
                warn!(platform = %schedule.platform, error = %e, "content generation failed");
                report.failures.push(GenerationFailure {
                    platform: schedule.platform.clone(),
                    slot: None,
                    error: e.to_string(),
                });
            }
        }

        info!(
            weekday,
            created = report.posts_created,
            skipped = report.skipped_platforms.len(),
            failures = report.failures.len(),
            "content pass finished"
        );
        Ok(report)
    }

    /// Generate every slot of one schedule for the civil day of `now`.
    ///
    /// Slot errors are recorded in `report`; the first one is returned when
    /// no slot succeeded so a queued job can retry.
    pub(crate) async fn generate_for_schedule(
        &self,
        schedule: &Schedule,
        now: DateTime<Utc>,
        bounds: DayBounds,
        report: &mut GenerationReport,
    ) -> Result<()> {
        let platform = schedule.platform.as_str();
        if self
            .deps
            .store
            .has_content_today(&schedule.user_id, platform, bounds)
            .await?
        {
            debug!(platform, "content already exists today");
            report.skipped_platforms.push(platform.to_string());
            return Ok(());
        }

        let mut created = 0;
        let mut first_error = None;
        for slot in schedule.preferred_times.iter().take(schedule.slot_count()) {
            match self.generate_slot(schedule, slot, now).await {
                Ok(Some(post)) => {
                    created += 1;
                    info!(
                        platform,
                        post_id = %post.id,
                        scheduled_for = %post.scheduled_for,
                        "content scheduled"
                    );
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(platform, slot = %slot, error = %e, "slot generation failed");
                    report.failures.push(GenerationFailure {
                        platform: platform.to_string(),
                        slot: Some(slot.clone()),
                        error: e.to_string(),
                    });
                    first_error.get_or_insert(e);
                }
            }
        }
        report.posts_created += created;

        match first_error {
            Some(e) if created == 0 => Err(e),
            _ => Ok(()),
        }
    }

    async fn generate_slot(
        &self,
        schedule: &Schedule,
        slot: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Post>> {
        let platform = schedule.platform.as_str();
        let time = parse_slot(slot)?;
        let scheduled_for = self
            .clock
            .next_slot_occurrence(now, time, &schedule.days_of_week)
            .ok_or_else(|| {
                SchedulerError::InvalidSchedule(format!("{platform} schedule has no valid weekday"))
            })?;
        let topic = self
            .config
            .topics
            .choose(&mut rand::rng())
            .cloned()
            .unwrap_or_else(|| platform.to_string());

        let key = format!("content_generation:{platform}");
        let content = self
            .breaker
            .execute(&key, || self.deps.generator.generate(platform, &topic))
            .await?;

        let inserted = self
            .deps
            .store
            .insert_scheduled_post(NewPost {
                user_id: schedule.user_id.clone(),
                platform: platform.to_string(),
                content,
                scheduled_for,
                created_at: now,
            })
            .await;
        let post = match inserted {
            Ok(post) => post,
            Err(CollaboratorError::Conflict(reason)) => {
                debug!(platform, slot, reason, "slot already filled");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };

        self.enqueue_posting(&post).await;
        notify_detached(
            &self.deps.notifier,
            NotifyEvent::ContentGenerated {
                platform: post.platform.clone(),
                post_id: post.id.clone(),
                scheduled_for: post.scheduled_for,
            },
        );
        Ok(Some(post))
    }

    // === Live changes and re-seeding ===

    #[tracing::instrument(skip(self, event))]
    pub(crate) async fn handle_change(&self, event: ChangeEvent, now: DateTime<Utc>) -> Result<()> {
        match event {
            ChangeEvent::ScheduleUpserted(schedule) => {
                if schedule.user_id != self.config.user_id
                    || !schedule.is_active
                    || !schedule.runs_on(self.clock.weekday_index(now))
                {
                    return Ok(());
                }
                let bounds = self.clock.day_bounds(now);
                if self
                    .deps
                    .store
                    .has_content_today(&schedule.user_id, &schedule.platform, bounds)
                    .await?
                {
                    return Ok(());
                }

                let date = self.clock.civil_date(now);
                let id = self
                    .queue
                    .add_job(
                        NewJob::new(JobKind::ContentGeneration, &schedule.user_id)
                            .priority(JobPriority::High)
                            .platform(&schedule.platform)
                            .payload(serde_json::json!({ "platform": schedule.platform }))
                            .at(now)
                            .dedupe_key(format!("generate:{}:{date}", schedule.platform)),
                    )
                    .await;
                info!(job_id = %id, platform = %schedule.platform, "schedule changed, generation queued");
            }
            ChangeEvent::PostInserted(post) => {
                if post.user_id == self.config.user_id && post.status == PostStatus::Scheduled {
                    self.enqueue_posting(&post).await;
                }
            }
        }
        Ok(())
    }

    pub(crate) async fn reseed_from_store(&self) -> Result<usize> {
        let posts = self
            .deps
            .store
            .list_pending_posts(&self.config.user_id)
            .await?;
        for post in &posts {
            self.enqueue_posting(post).await;
        }
        Ok(posts.len())
    }

    async fn enqueue_posting(&self, post: &Post) -> String {
        self.queue
            .add_job(
                NewJob::new(JobKind::ContentPosting, &post.user_id)
                    .platform(&post.platform)
                    .payload(serde_json::json!({ "post_id": post.id }))
                    .at(post.scheduled_for)
                    .dedupe_key(format!("post:{}", post.id)),
            )
            .await
    }

    // === Publishing ===

    pub(crate) async fn publish(
        &self,
        platform: &str,
        content: &GeneratedContent,
        user_id: &str,
        post_id: Option<&str>,
    ) -> Result<PublishOutcome> {
        let decision = self.limiter.check_limit(user_id, Some(platform));
        if !decision.allowed {
            return Err(SchedulerError::RateLimited {
                key: format!("{user_id}:{platform}"),
                retry_after_secs: decision.retry_after_secs.unwrap_or(1),
            });
        }

        let key = format!("platform:{platform}");
        let outcome = self
            .breaker
            .execute_with_fallback(
                &key,
                || async {
                    let remote_id = self.deps.publisher.publish(platform, content).await?;
                    Ok::<_, SchedulerError>(PublishOutcome::Published { remote_id })
                },
                || async {
                    self.save_for_later(platform, content, user_id, post_id)
                        .await?;
                    Ok::<_, SchedulerError>(PublishOutcome::SavedForLater)
                },
            )
            .await
            .map_err(SchedulerError::from)?;
        Ok(outcome)
    }

    async fn save_for_later(
        &self,
        platform: &str,
        content: &GeneratedContent,
        user_id: &str,
        post_id: Option<&str>,
    ) -> Result<()> {
        match post_id {
            Some(id) => self.deps.store.mark_draft(id).await?,
            None => {
                self.deps
                    .store
                    .save_draft(user_id, platform, content, Utc::now())
                    .await?;
            }
        }
        warn!(platform, ?post_id, "platform unavailable, content saved as draft");
        Ok(())
    }

    pub(crate) fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub(crate) fn clock(&self) -> &CivilClock {
        &self.clock
    }

    pub(crate) fn store(&self) -> &Arc<dyn Store> {
        &self.deps.store
    }

    pub(crate) fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.deps.notifier
    }
}
