//! In-memory priority job queue.
//!
//! A single dispatch loop claims due jobs on a fixed tick and spawns each one
//! on its own task, so a slow or failing job never delays the next tick.
//! Failures are retried with exponential backoff until `max_retries` is
//! reached, after which the job is parked as `Failed` for good.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures_util::FutureExt;
use rand::Rng;
use tokio::sync::{Mutex, Notify, RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{Instrument, debug, error, info, trace, warn};

use crate::config::{QueueConfig, RetryPolicy};
use crate::error::{Result, SchedulerError};
use crate::types::{Job, JobKind, JobRef, JobStats, JobStatus, NewJob};

/// Executes jobs of one kind.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: Job) -> Result<()>;
}

/// Job lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Added(JobRef),
    Started(JobRef),
    Completed {
        job: JobRef,
        elapsed_ms: u64,
    },
    Retrying {
        job: JobRef,
        retry_count: u32,
        delay_ms: u64,
        error: String,
    },
    Failed {
        job: JobRef,
        error: String,
    },
}

struct DispatchLoop {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

/// Priority job queue with retry and bounded per-tick concurrency.
pub struct JobQueue {
    config: QueueConfig,
    retry: RetryPolicy,
    jobs: RwLock<HashMap<String, Job>>,
    handlers: DashMap<JobKind, Arc<dyn JobHandler>>,
    events: broadcast::Sender<JobEvent>,
    in_flight: AtomicUsize,
    idle: Notify,
    dispatch: Mutex<Option<DispatchLoop>>,
}

impl JobQueue {
    pub fn new(config: QueueConfig, retry: RetryPolicy) -> Arc<Self> {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Arc::new(Self {
            config,
            retry,
            jobs: RwLock::new(HashMap::new()),
            handlers: DashMap::new(),
            events,
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            dispatch: Mutex::new(None),
        })
    }

    /// Route jobs of `kind` to `handler`, replacing any earlier registration.
    pub fn register(&self, kind: JobKind, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(kind, handler);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    /// Enqueue a job and return its id.
    ///
    /// A job carrying a dedupe key that matches a job which has not finished
    /// yet is collapsed into it; the existing id is returned.
    #[tracing::instrument(skip(self, new), fields(kind = %new.kind))]
    pub async fn add_job(&self, new: NewJob) -> String {
        let now = Utc::now();
        let job = {
            let mut jobs = self.jobs.write().await;
            if let Some(key) = new.dedupe_key.as_deref()
                && let Some(existing) = jobs
                    .values()
                    .find(|j| !j.status.is_terminal() && j.dedupe_key.as_deref() == Some(key))
            {
                debug!(job_id = %existing.id, dedupe_key = key, "job already queued");
                return existing.id.clone();
            }

            let job = Job::from_new(new, self.config.default_max_retries, now);
            jobs.insert(job.id.clone(), job.clone());
            job
        };

        debug!(
            job_id = %job.id,
            priority = ?job.priority,
            scheduled_time = %job.scheduled_time,
            "job added"
        );
        self.emit(JobEvent::Added(job.job_ref()));
        job.id
    }

    /// Start the dispatch loop. No-op if already running.
    pub async fn start(self: &Arc<Self>) {
        let mut slot = self.dispatch.lock().await;
        if slot.is_some() {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = Arc::clone(self);
        let handle = tokio::spawn(async move { queue.run(shutdown_rx).await });
        *slot = Some(DispatchLoop {
            shutdown_tx,
            handle,
        });
        info!(
            interval_secs = self.config.dispatch_interval_secs,
            batch_size = self.config.batch_size,
            "job queue started"
        );
    }

    /// Stop the dispatch loop. Jobs already running are left to finish.
    pub async fn stop(&self) {
        let Some(dispatch) = self.dispatch.lock().await.take() else {
            return;
        };
        if dispatch.shutdown_tx.send(true).is_err() {
            trace!("dispatch loop already gone");
        }
        if let Err(e) = dispatch.handle.await {
            error!(error = %e, "dispatch loop ended abnormally");
        }
        info!("job queue stopped");
    }

    pub async fn is_running(&self) -> bool {
        self.dispatch.lock().await.is_some()
    }

    async fn run(self: Arc<Self>, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.dispatch_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        debug!("dispatch loop received shutdown");
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.dispatch_due().await;
                }
            }
        }
    }

    /// Claim and spawn every due job allowed by the batch cap.
    pub async fn dispatch_due(self: &Arc<Self>) -> Vec<String> {
        self.dispatch_due_at(Utc::now()).await
    }

    /// [`dispatch_due`](Self::dispatch_due) against an explicit clock.
    pub async fn dispatch_due_at(self: &Arc<Self>, now: DateTime<Utc>) -> Vec<String> {
        let claimed: Vec<Job> = {
            let mut jobs = self.jobs.write().await;
            let ids = select_batch(jobs.values(), now, self.config.batch_size);
            ids.iter()
                .filter_map(|id| {
                    let job = jobs.get_mut(id)?;
                    job.status = JobStatus::Processing;
                    job.updated_at = now;
                    Some(job.clone())
                })
                .collect()
        };

        if !claimed.is_empty() {
            debug!(count = claimed.len(), "dispatching jobs");
        }

        let mut ids = Vec::with_capacity(claimed.len());
        for job in claimed {
            ids.push(job.id.clone());
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            self.emit(JobEvent::Started(job.job_ref()));

            let span = tracing::info_span!("job", job_id = %job.id, kind = %job.kind);
            let queue = Arc::clone(self);
            tokio::spawn(async move { queue.execute(job).await }.instrument(span));
        }
        ids
    }

    async fn execute(self: Arc<Self>, job: Job) {
        let started = tokio::time::Instant::now();
        let handler = self.handlers.get(&job.kind).map(|h| Arc::clone(h.value()));

        let result = match handler {
            Some(handler) => AssertUnwindSafe(handler.handle(job.clone()))
                .catch_unwind()
                .await
                .unwrap_or(Err(SchedulerError::HandlerPanicked)),
            None => Err(SchedulerError::UnknownJobKind(job.kind)),
        };

        match result {
            Ok(()) => self.complete(&job.id, started.elapsed()).await,
            Err(e) => self.handle_failure(&job.id, e).await,
        }

        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_waiters();
        }
    }

    async fn complete(&self, id: &str, elapsed: Duration) {
        let job_ref = {
            let mut jobs = self.jobs.write().await;
            let Some(job) = jobs.get_mut(id) else {
                return;
            };
            job.status = JobStatus::Completed;
            job.updated_at = Utc::now();
            job.last_error = None;
            job.job_ref()
        };

        let elapsed_ms = elapsed.as_millis() as u64;
        info!(job_id = %id, elapsed_ms, "job completed");
        self.emit(JobEvent::Completed {
            job: job_ref,
            elapsed_ms,
        });
    }

    async fn handle_failure(&self, id: &str, err: SchedulerError) {
        let now = Utc::now();
        let message = err.to_string();
        let jitter: f64 = rand::rng().random();

        let event = {
            let mut jobs = self.jobs.write().await;
            let Some(job) = jobs.get_mut(id) else {
                return;
            };
            job.last_error = Some(message.clone());
            job.updated_at = now;

            if err.is_retryable() {
                job.retry_count = (job.retry_count + 1).min(job.max_retries);
            }

            let retry = if err.is_retryable() && job.retry_count < job.max_retries {
                let delay_ms = job
                    .next_retry_delay_ms(&self.retry, err.retry_after_secs(), jitter)
                    .min(self.max_retry_delay_ms());
                i64::try_from(delay_ms)
                    .ok()
                    .and_then(chrono::Duration::try_milliseconds)
                    .and_then(|delay| now.checked_add_signed(delay))
                    .map(|next| (next, delay_ms))
            } else {
                None
            };

            if let Some((next, delay_ms)) = retry {
                job.scheduled_time = job.scheduled_time.max(next);
                job.last_backoff_ms = delay_ms;
                job.status = JobStatus::Pending;

                warn!(
                    job_id = %id,
                    retry_count = job.retry_count,
                    delay_ms,
                    error = %message,
                    "job failed, scheduling retry"
                );
                JobEvent::Retrying {
                    job: job.job_ref(),
                    retry_count: job.retry_count,
                    delay_ms,
                    error: message,
                }
            } else {
                job.status = JobStatus::Failed;
                error!(
                    job_id = %id,
                    retry_count = job.retry_count,
                    error = %message,
                    "job permanently failed"
                );
                JobEvent::Failed {
                    job: job.job_ref(),
                    error: message,
                }
            }
        };

        self.emit(event);
    }

    /// Longest wait before a retry, one retention window.
    fn max_retry_delay_ms(&self) -> u64 {
        self.config.retention_hours.saturating_mul(3_600_000)
    }

    /// Delete finished jobs older than the retention window.
    pub async fn cleanup(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.config.retention();
        let mut jobs = self.jobs.write().await;
        let before = jobs.len();
        jobs.retain(|_, job| !(job.status.is_terminal() && job.updated_at < cutoff));
        let removed = before - jobs.len();
        if removed > 0 {
            info!(removed, "cleaned up finished jobs");
        }
        removed
    }

    pub async fn stats(&self) -> JobStats {
        let jobs = self.jobs.read().await;
        let mut stats = JobStats {
            total: jobs.len(),
            ..Default::default()
        };
        for job in jobs.values() {
            match job.status {
                JobStatus::Pending => stats.pending += 1,
                JobStatus::Processing => stats.processing += 1,
                JobStatus::Completed => stats.completed += 1,
                JobStatus::Failed => stats.failed += 1,
            }
        }
        stats
    }

    /// Jobs in `status`, earliest scheduled first.
    pub async fn jobs_by_status(&self, status: JobStatus) -> Vec<Job> {
        let mut jobs: Vec<Job> = self
            .jobs
            .read()
            .await
            .values()
            .filter(|j| j.status == status)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| a.scheduled_time.cmp(&b.scheduled_time));
        jobs
    }

    pub async fn get_job(&self, id: &str) -> Result<Job> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| SchedulerError::JobNotFound(id.to_string()))
    }

    /// Number of jobs currently executing.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Wait until no job is executing. Returns `false` on timeout.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        let drained = async {
            loop {
                let notified = self.idle.notified();
                if self.in_flight() == 0 {
                    return;
                }
                notified.await;
            }
        };
        tokio::time::timeout(timeout, drained).await.is_ok()
    }

    fn emit(&self, event: JobEvent) {
        if self.events.send(event).is_err() {
            trace!("no subscribers for job event");
        }
    }
}

/// Ids of the jobs one dispatch tick claims: due and pending, highest
/// priority first, then earliest `scheduled_time`, at most `cap`.
pub fn select_batch<'a>(
    jobs: impl IntoIterator<Item = &'a Job>,
    now: DateTime<Utc>,
    cap: usize,
) -> Vec<String> {
    let mut due: Vec<&Job> = jobs.into_iter().filter(|j| j.is_due(now)).collect();
    due.sort_by(|a, b| {
        (Reverse(a.priority), a.scheduled_time, a.created_at, &a.id).cmp(&(
            Reverse(b.priority),
            b.scheduled_time,
            b.created_at,
            &b.id,
        ))
    });
    due.into_iter().take(cap).map(|j| j.id.clone()).collect()
}
