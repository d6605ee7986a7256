//! Store change feed with polling fallback.
//!
//! Prefers the store's push subscription. When it cannot be opened, or the
//! stream ends, the listener polls the change log on a fixed interval and
//! retries the subscription with exponential backoff. A cursor over the
//! change log makes the hand-over between the two lossless.

use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::collaborators::{ChangeStream, Store};
use crate::types::ChangeEvent;

/// How the listener is currently receiving changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum FeedMode {
    /// Not running.
    Idle = 0,
    /// Consuming the push subscription.
    Streaming = 1,
    /// Polling the change log.
    Polling = 2,
}

impl From<u8> for FeedMode {
    fn from(v: u8) -> Self {
        match v {
            1 => FeedMode::Streaming,
            2 => FeedMode::Polling,
            _ => FeedMode::Idle,
        }
    }
}

enum Exit {
    Shutdown,
    Disconnected,
}

/// Forwards store changes to a channel until shut down.
pub struct ChangeListener {
    store: Arc<dyn Store>,
    poll_interval: Duration,
    mode: AtomicU8,
}

impl ChangeListener {
    pub fn new(store: Arc<dyn Store>, poll_interval: Duration) -> Self {
        Self {
            store,
            poll_interval,
            mode: AtomicU8::new(FeedMode::Idle as u8),
        }
    }

    pub fn mode(&self) -> FeedMode {
        FeedMode::from(self.mode.load(Ordering::SeqCst))
    }

    fn set_mode(&self, mode: FeedMode) {
        self.mode.store(mode as u8, Ordering::SeqCst);
    }

    /// Position to pass to [`run`](Self::run) so that every change made
    /// after this call is delivered.
    pub async fn start_cursor(&self) -> u64 {
        match self.store.current_cursor().await {
            Ok(cursor) => cursor,
            Err(e) => {
                warn!(error = %e, "could not read change cursor, replaying from start");
                0
            }
        }
    }

    /// Forward every change after `cursor` to `tx`.
    pub async fn run(
        &self,
        mut cursor: u64,
        tx: mpsc::Sender<ChangeEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        let mut backoff = ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(60),
            max_elapsed_time: None,
            ..Default::default()
        };

        loop {
            if *shutdown_rx.borrow() {
                break;
            }

            match self.store.subscribe_changes().await {
                Ok(stream) => {
                    backoff.reset();
                    self.set_mode(FeedMode::Streaming);
                    info!(cursor, "change subscription established");

                    match self.consume(stream, &mut cursor, &tx, &mut shutdown_rx).await {
                        Exit::Shutdown => break,
                        Exit::Disconnected => warn!("change stream ended, falling back to polling"),
                    }
                }
                Err(e) => warn!(error = %e, "change subscription failed, polling"),
            }

            self.set_mode(FeedMode::Polling);
            let wait = backoff.next_backoff().unwrap_or(Duration::from_secs(60));
            let retry_at = Instant::now() + wait;
            debug!(wait_ms = wait.as_millis() as u64, "next subscription attempt scheduled");

            if let Exit::Shutdown = self
                .poll_until(retry_at, &mut cursor, &tx, &mut shutdown_rx)
                .await
            {
                break;
            }
        }

        self.set_mode(FeedMode::Idle);
        info!("change listener stopped");
    }

    async fn consume(
        &self,
        mut stream: ChangeStream,
        cursor: &mut u64,
        tx: &mpsc::Sender<ChangeEvent>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Exit {
        // Changes made between reading the cursor and subscribing.
        if self.poll_once(cursor, tx).await.is_err() {
            return Exit::Shutdown;
        }

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return Exit::Shutdown;
                    }
                }
                item = stream.next() => {
                    let Some(record) = item else {
                        return Exit::Disconnected;
                    };
                    if record.seq <= *cursor {
                        continue;
                    }
                    if record.seq > *cursor + 1 {
                        debug!(cursor = *cursor, seq = record.seq, "gap in change stream, backfilling");
                        if self.poll_once(cursor, tx).await.is_err() {
                            return Exit::Shutdown;
                        }
                        continue;
                    }
                    *cursor = record.seq;
                    if tx.send(record.event).await.is_err() {
                        return Exit::Shutdown;
                    }
                }
            }
        }
    }

    async fn poll_until(
        &self,
        retry_at: Instant,
        cursor: &mut u64,
        tx: &mpsc::Sender<ChangeEvent>,
        shutdown_rx: &mut watch::Receiver<bool>,
    ) -> Exit {
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let deadline = tokio::time::sleep_until(retry_at);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        return Exit::Shutdown;
                    }
                }
                _ = &mut deadline => return Exit::Disconnected,
                _ = ticker.tick() => {
                    if self.poll_once(cursor, tx).await.is_err() {
                        return Exit::Shutdown;
                    }
                }
            }
        }
    }

    /// Forward everything after `cursor`. Errs only when the receiver is gone.
    async fn poll_once(&self, cursor: &mut u64, tx: &mpsc::Sender<ChangeEvent>) -> Result<(), ()> {
        match self.store.changes_since(*cursor).await {
            Ok((records, next)) => {
                for record in records {
                    tx.send(record.event).await.map_err(|_| ())?;
                }
                *cursor = next;
            }
            Err(e) => warn!(error = %e, cursor = *cursor, "polling change log failed"),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryStore;
    use crate::types::Schedule;

    fn schedule(platform: &str) -> Schedule {
        Schedule {
            user_id: "alice".into(),
            platform: platform.into(),
            max_posts_per_day: 1,
            preferred_times: vec!["09:00".into()],
            days_of_week: vec![1],
            is_active: true,
        }
    }

    async fn spawn_listener(
        store: Arc<InMemoryStore>,
    ) -> (
        Arc<ChangeListener>,
        mpsc::Receiver<ChangeEvent>,
        watch::Sender<bool>,
    ) {
        let listener = Arc::new(ChangeListener::new(store, Duration::from_secs(5)));
        let (tx, rx) = mpsc::channel(16);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let cursor = listener.start_cursor().await;
        let task = Arc::clone(&listener);
        tokio::spawn(async move { task.run(cursor, tx, shutdown_rx).await });
        (listener, rx, shutdown_tx)
    }

    fn platform_of(event: ChangeEvent) -> String {
        match event {
            ChangeEvent::ScheduleUpserted(s) => s.platform,
            ChangeEvent::PostInserted(p) => p.platform,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_streams_changes_after_start() {
        let store = Arc::new(InMemoryStore::new());
        store.upsert_schedule(schedule("old")).await;

        let (listener, mut rx, shutdown_tx) = spawn_listener(store.clone()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(listener.mode(), FeedMode::Streaming);

        store.upsert_schedule(schedule("devto")).await;
        assert_eq!(platform_of(rx.recv().await.unwrap()), "devto");

        shutdown_tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(listener.mode(), FeedMode::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_when_subscription_unavailable() {
        let store = Arc::new(InMemoryStore::new());
        store.set_subscriptions_available(false);

        let (listener, mut rx, _shutdown_tx) = spawn_listener(store.clone()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(listener.mode(), FeedMode::Polling);

        store.upsert_schedule(schedule("devto")).await;
        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(platform_of(event), "devto");
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribes_after_stream_ends() {
        let store = Arc::new(InMemoryStore::new());
        let (listener, mut rx, _shutdown_tx) = spawn_listener(store.clone()).await;
        tokio::time::sleep(Duration::from_millis(10)).await;

        store.disconnect_subscribers().await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(listener.mode(), FeedMode::Polling);

        // Changes during the outage are still delivered, exactly once.
        store.upsert_schedule(schedule("devto")).await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(listener.mode(), FeedMode::Streaming);

        store.upsert_schedule(schedule("twitter")).await;
        assert_eq!(platform_of(rx.recv().await.unwrap()), "devto");
        assert_eq!(platform_of(rx.recv().await.unwrap()), "twitter");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_change_before_first_poll_is_delivered() {
        let store = Arc::new(InMemoryStore::new());
        store.upsert_schedule(schedule("old")).await;

        let (_listener, mut rx, _shutdown_tx) = spawn_listener(store.clone()).await;
        // The listener task has not run yet.
        store.upsert_schedule(schedule("devto")).await;

        let event = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(platform_of(event), "devto");
        assert!(rx.try_recv().is_err());
    }
}
