//! Daemon command: run the scheduler until interrupted.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use miette::Result;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use cadence_scheduler::{InMemoryStore, Scheduler, SchedulerDeps};

use crate::config::{load_config, load_schedules};
use crate::dry_run::{DryRunPublisher, LogNotifier, TemplateGenerator};

/// Configuration for the daemon.
pub struct DaemonConfig {
    pub config_path: Option<PathBuf>,
    pub schedules_path: Option<PathBuf>,
    pub user_id: Option<String>,
    /// Seconds between status log lines.
    pub status_interval: u64,
}

pub async fn run(config: DaemonConfig) -> Result<()> {
    let scheduler_config = load_config(config.config_path.as_deref(), config.user_id.as_deref())
        .map_err(|e| miette::miette!("{}", e))?;
    let schedules =
        load_schedules(config.schedules_path.as_deref()).map_err(|e| miette::miette!("{}", e))?;

    let store = Arc::new(InMemoryStore::new());
    for schedule in schedules {
        if schedule.user_id != scheduler_config.user_id {
            warn!(
                user_id = %schedule.user_id,
                platform = %schedule.platform,
                "schedule belongs to another user, loading anyway"
            );
        }
        store.upsert_schedule(schedule).await;
    }

    info!(
        user_id = %scheduler_config.user_id,
        utc_offset_minutes = scheduler_config.utc_offset_minutes,
        "starting Cadence daemon"
    );

    let scheduler = Scheduler::new(
        scheduler_config,
        SchedulerDeps {
            store,
            generator: Arc::new(TemplateGenerator),
            publisher: Arc::new(DryRunPublisher::default()),
            notifier: Arc::new(LogNotifier),
        },
    )
    .map_err(|e| miette::miette!("failed to create scheduler: {}", e))?;

    // Create shutdown channel
    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

    // Handle shutdown signals
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            return;
        }
        info!("received shutdown signal");
        if shutdown_tx.send(true).is_err() {
            warn!("daemon already exiting");
        }
    });

    scheduler.start().await;

    let mut status_tick =
        tokio::time::interval(Duration::from_secs(config.status_interval.max(1)));
    status_tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            _ = status_tick.tick() => log_status(&scheduler).await,
        }
    }

    let report = scheduler.emergency_stop().await;
    info!(
        drained = report.drained,
        in_flight = report.in_flight,
        "Cadence daemon stopped"
    );
    Ok(())
}

async fn log_status(scheduler: &Scheduler) {
    let status = scheduler.status().await;
    let queue = status.summary.queue;
    info!(
        running = status.running,
        change_feed = ?status.change_feed,
        pending = queue.pending,
        processing = queue.processing,
        completed = queue.completed,
        failed = queue.failed,
        health = ?status.summary.health.as_ref().map(|h| h.status),
        "scheduler status"
    );
    for window in &status.windows {
        info!(
            window = ?window.kind,
            armed = window.armed,
            next_fire = ?window.next_fire,
            last_run = ?window.last_run,
            "trigger window"
        );
    }
}
