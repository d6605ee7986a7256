//! Collaborators that log instead of calling real services.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use cadence_scheduler::{
    CollabResult, ContentGenerator, GeneratedContent, Notifier, NotifyEvent, Publisher,
};
use tracing::info;

/// Builds content from a fixed template around the topic.
pub struct TemplateGenerator;

#[async_trait]
impl ContentGenerator for TemplateGenerator {
    async fn generate(&self, platform: &str, topic: &str) -> CollabResult<GeneratedContent> {
        Ok(GeneratedContent {
            title: format!("Notes on {topic}"),
            body: format!(
                "A few practical observations about {topic}, written for {platform} readers."
            ),
            tags: vec![topic.replace(' ', "-").to_lowercase(), platform.to_string()],
        })
    }
}

/// Logs each publish and returns a synthetic remote id.
#[derive(Default)]
pub struct DryRunPublisher {
    published: AtomicU64,
}

#[async_trait]
impl Publisher for DryRunPublisher {
    async fn publish(&self, platform: &str, content: &GeneratedContent) -> CollabResult<String> {
        let n = self.published.fetch_add(1, Ordering::SeqCst) + 1;
        let remote_id = format!("dry-run-{platform}-{n}");
        info!(platform, title = %content.title, %remote_id, "dry run: would publish");
        Ok(remote_id)
    }
}

/// Writes notifications to the log as JSON.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, event: NotifyEvent) -> CollabResult<()> {
        match serde_json::to_string(&event) {
            Ok(json) => info!(event = %json, "notification"),
            Err(_) => info!(?event, "notification"),
        }
        Ok(())
    }
}
