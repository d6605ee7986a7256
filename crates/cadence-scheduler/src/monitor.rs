//! Metrics, health checks and status snapshots.
//!
//! The monitor consumes job lifecycle events into an in-memory time series,
//! periodically snapshots queue, breaker and limiter state, and runs health
//! checks against the store. Points older than the retention window are
//! pruned on every tick.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, DurationRound, TimeDelta, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::circuit::{CircuitBreaker, CircuitStatus};
use crate::collaborators::Store;
use crate::config::MonitorConfig;
use crate::queue::{JobEvent, JobQueue};
use crate::rate_limit::{RateLimitStats, RateLimiter};
use crate::types::{JobRef, JobStats};

/// One recorded sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub name: String,
    pub value: f64,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Classify by number of failed checks.
    pub fn from_failures(failed: usize) -> Self {
        match failed {
            0 => HealthStatus::Healthy,
            1 => HealthStatus::Degraded,
            _ => HealthStatus::Unhealthy,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthCheck {
    pub name: String,
    pub passed: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub checks: Vec<HealthCheck>,
    pub checked_at: DateTime<Utc>,
}

/// Job outcomes over the last hour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecentActivity {
    pub completed: usize,
    pub failed: usize,
    pub retries: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSummary {
    pub uptime_secs: u64,
    pub queue: JobStats,
    /// Completed / (completed + failed) per platform over the last 24 hours.
    pub success_rate_by_platform: BTreeMap<String, f64>,
    pub circuits: Vec<CircuitStatus>,
    pub rate_limits: RateLimitStats,
    pub recent: RecentActivity,
    pub health: Option<HealthReport>,
}

/// Bucket width for [`SchedulerMonitor::aggregated_metrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BucketInterval {
    Minute,
    Hour,
    /// UTC days.
    Day,
}

impl BucketInterval {
    fn width(self) -> TimeDelta {
        match self {
            BucketInterval::Minute => TimeDelta::minutes(1),
            BucketInterval::Hour => TimeDelta::hours(1),
            BucketInterval::Day => TimeDelta::days(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricBucket {
    pub start: DateTime<Utc>,
    pub count: usize,
    pub sum: f64,
    pub avg: f64,
    pub min: f64,
    pub max: f64,
}

struct MonitorTasks {
    shutdown_tx: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

pub struct SchedulerMonitor {
    config: MonitorConfig,
    queue: Arc<JobQueue>,
    breaker: Arc<CircuitBreaker>,
    limiter: Arc<RateLimiter>,
    store: Arc<dyn Store>,
    metrics: RwLock<Vec<MetricPoint>>,
    last_health: RwLock<Option<HealthReport>>,
    started: Instant,
    tasks: Mutex<Option<MonitorTasks>>,
}

impl SchedulerMonitor {
    pub fn new(
        config: MonitorConfig,
        queue: Arc<JobQueue>,
        breaker: Arc<CircuitBreaker>,
        limiter: Arc<RateLimiter>,
        store: Arc<dyn Store>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            queue,
            breaker,
            limiter,
            store,
            metrics: RwLock::new(Vec::new()),
            last_health: RwLock::new(None),
            started: Instant::now(),
            tasks: Mutex::new(None),
        })
    }

    /// Start the event consumer and the periodic tick. No-op if running.
    pub async fn start(self: &Arc<Self>) {
        let mut slot = self.tasks.lock().await;
        if slot.is_some() {
            return;
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let events = self.queue.subscribe();

        let consumer = {
            let monitor = Arc::clone(self);
            let shutdown_rx = shutdown_rx.clone();
            tokio::spawn(async move { monitor.consume_events(events, shutdown_rx).await })
        };
        let ticker = {
            let monitor = Arc::clone(self);
            tokio::spawn(async move { monitor.run_ticks(shutdown_rx).await })
        };

        *slot = Some(MonitorTasks {
            shutdown_tx,
            handles: vec![consumer, ticker],
        });
        info!(interval_secs = self.config.interval_secs, "monitor started");
    }

    pub async fn stop(&self) {
        let Some(tasks) = self.tasks.lock().await.take() else {
            return;
        };
        if tasks.shutdown_tx.send(true).is_err() {
            debug!("monitor tasks already gone");
        }
        for handle in tasks.handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "monitor task ended abnormally");
            }
        }
        info!("monitor stopped");
    }

    async fn consume_events(
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
                    Ok(event) => self.record_event(&event).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "monitor lagged behind job events");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }

    async fn run_ticks(&self, mut shutdown_rx: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.config.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => self.tick(Utc::now()).await,
            }
        }
    }

    /// Snapshot component state, run health checks and prune old points.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let stats = self.queue.stats().await;
        let limiter = self.limiter.stats();
        let snapshot = [
            ("queue.pending", stats.pending as f64),
            ("queue.processing", stats.processing as f64),
            ("queue.completed", stats.completed as f64),
            ("queue.failed", stats.failed as f64),
            ("circuit.open", self.breaker.open_count() as f64),
            ("rate_limit.active_keys", limiter.active_keys as f64),
        ];
        {
            let mut metrics = self.metrics.write().await;
            for (name, value) in snapshot {
                metrics.push(MetricPoint {
                    timestamp: now,
                    name: name.to_string(),
                    value,
                    tags: BTreeMap::new(),
                });
            }
        }

        let report = self.run_health_checks(now).await;
        if report.status != HealthStatus::Healthy {
            warn!(status = ?report.status, "scheduler health degraded");
        }

        let pruned = self.prune(now).await;
        debug!(pruned, status = ?report.status, "monitor tick");
    }

    /// Run every health check and remember the result.
    pub async fn run_health_checks(&self, now: DateTime<Utc>) -> HealthReport {
        let mut checks = Vec::with_capacity(3);

        let stats = self.queue.stats().await;
        let finished = stats.completed + stats.failed;
        let failure_rate = if finished == 0 {
            0.0
        } else {
            stats.failed as f64 / finished as f64
        };
        checks.push(HealthCheck {
            name: "queue".to_string(),
            passed: failure_rate <= self.config.failure_rate_threshold,
            detail: format!("failure rate {failure_rate:.2}"),
        });

        let store = self.store.ping().await;
        checks.push(HealthCheck {
            name: "store".to_string(),
            passed: store.is_ok(),
            detail: match store {
                Ok(()) => "reachable".to_string(),
                Err(e) => e.to_string(),
            },
        });

        let unhealthy: Vec<String> = self
            .breaker
            .all_status()
            .into_iter()
            .filter(|c| !c.healthy)
            .map(|c| c.key)
            .collect();
        checks.push(HealthCheck {
            name: "circuits".to_string(),
            passed: unhealthy.is_empty(),
            detail: if unhealthy.is_empty() {
                "all healthy".to_string()
            } else {
                format!("unhealthy: {}", unhealthy.join(", "))
            },
        });

        let failed = checks.iter().filter(|c| !c.passed).count();
        let report = HealthReport {
            status: HealthStatus::from_failures(failed),
            checks,
            checked_at: now,
        };
        *self.last_health.write().await = Some(report.clone());
        report
    }

    pub async fn last_health(&self) -> Option<HealthReport> {
        self.last_health.read().await.clone()
    }

    /// Append one sample.
    pub async fn record(&self, name: &str, value: f64, tags: BTreeMap<String, String>) {
        self.metrics.write().await.push(MetricPoint {
            timestamp: Utc::now(),
            name: name.to_string(),
            value,
            tags,
        });
    }

    async fn record_event(&self, event: &JobEvent) {
        match event {
            JobEvent::Added(job) => self.record("jobs.added", 1.0, job_tags(job)).await,
            JobEvent::Started(job) => self.record("jobs.started", 1.0, job_tags(job)).await,
            JobEvent::Completed { job, elapsed_ms } => {
                self.record("jobs.completed", 1.0, job_tags(job)).await;
                self.record("jobs.duration_ms", *elapsed_ms as f64, job_tags(job))
                    .await;
            }
            JobEvent::Retrying { job, .. } => self.record("jobs.retries", 1.0, job_tags(job)).await,
            JobEvent::Failed { job, .. } => self.record("jobs.failed", 1.0, job_tags(job)).await,
        }
    }

    async fn prune(&self, now: DateTime<Utc>) -> usize {
        let cutoff = now - self.config.metric_retention();
        let mut metrics = self.metrics.write().await;
        let before = metrics.len();
        metrics.retain(|m| m.timestamp >= cutoff);
        before - metrics.len()
    }

    /// Points named `name` recorded at or after `since`.
    pub async fn metrics(&self, name: &str, since: DateTime<Utc>) -> Vec<MetricPoint> {
        self.metrics
            .read()
            .await
            .iter()
            .filter(|m| m.name == name && m.timestamp >= since)
            .cloned()
            .collect()
    }

    /// Bucket the points named `name` since `since`, oldest bucket first.
    pub async fn aggregated_metrics(
        &self,
        name: &str,
        since: DateTime<Utc>,
        interval: BucketInterval,
    ) -> Vec<MetricBucket> {
        let mut buckets: BTreeMap<DateTime<Utc>, MetricBucket> = BTreeMap::new();
        for point in self.metrics(name, since).await {
            let Ok(start) = point.timestamp.duration_trunc(interval.width()) else {
                continue;
            };
            let bucket = buckets.entry(start).or_insert(MetricBucket {
                start,
                count: 0,
                sum: 0.0,
                avg: 0.0,
                min: f64::INFINITY,
                max: f64::NEG_INFINITY,
            });
            bucket.count += 1;
            bucket.sum += point.value;
            bucket.min = bucket.min.min(point.value);
            bucket.max = bucket.max.max(point.value);
        }

        buckets
            .into_values()
            .map(|mut b| {
                b.avg = b.sum / b.count as f64;
                b
            })
            .collect()
    }

    pub async fn status_summary(&self) -> StatusSummary {
        let now = Utc::now();
        let day_ago = now - TimeDelta::hours(24);
        let hour_ago = now - TimeDelta::hours(1);

        let (success_rate_by_platform, recent) = {
            let metrics = self.metrics.read().await;
            let mut outcomes: BTreeMap<String, (usize, usize)> = BTreeMap::new();
            let mut recent = RecentActivity::default();

            for point in metrics.iter().filter(|m| m.timestamp >= day_ago) {
                let is_recent = point.timestamp >= hour_ago;
                let platform = point.tags.get("platform");
                match point.name.as_str() {
                    "jobs.completed" => {
                        if let Some(p) = platform {
                            outcomes.entry(p.clone()).or_default().0 += 1;
                        }
                        recent.completed += usize::from(is_recent);
                    }
                    "jobs.failed" => {
                        if let Some(p) = platform {
                            outcomes.entry(p.clone()).or_default().1 += 1;
                        }
                        recent.failed += usize::from(is_recent);
                    }
                    "jobs.retries" => recent.retries += usize::from(is_recent),
                    _ => {}
                }
            }

            let rates: BTreeMap<String, f64> = outcomes
                .into_iter()
                .map(|(platform, (ok, failed))| (platform, ok as f64 / (ok + failed) as f64))
                .collect();
            (rates, recent)
        };

        StatusSummary {
            uptime_secs: self.started.elapsed().as_secs(),
            queue: self.queue.stats().await,
            success_rate_by_platform,
            circuits: self.breaker.all_status(),
            rate_limits: self.limiter.stats(),
            recent,
            health: self.last_health().await,
        }
    }
}

fn job_tags(job: &JobRef) -> BTreeMap<String, String> {
    let mut tags = BTreeMap::new();
    tags.insert("kind".to_string(), job.kind.to_string());
    if let Some(platform) = &job.platform {
        tags.insert("platform".to_string(), platform.clone());
    }
    tags
}
