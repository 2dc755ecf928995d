//! Restart notifications.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_restart(&self) -> Result<()>;
}

#[derive(Debug, Serialize)]
pub struct RestartEvent {
    pub event: &'static str,
    pub title: String,
    pub version: &'static str,
    pub date: DateTime<Utc>,
}

impl RestartEvent {
    pub fn now() -> Self {
        Self {
            event: "server.restarted",
            title: "Shipyard server restarted".to_string(),
            version: env!("CARGO_PKG_VERSION"),
            date: Utc::now(),
        }
    }
}

/// POSTs a JSON `RestartEvent` to every configured webhook.
///
/// A failing webhook is logged and skipped; the remaining ones still fire.
pub struct WebhookNotifier {
    client: reqwest::Client,
    urls: Vec<String>,
}

impl WebhookNotifier {
    pub fn new(urls: Vec<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            urls,
        }
    }

    async fn post(&self, url: &str, event: &RestartEvent) -> Result<()> {
        self.client
            .post(url)
            .json(event)
            .send()
            .await
            .with_context(|| format!("Failed to reach webhook {}", url))?
            .error_for_status()
            .with_context(|| format!("Webhook {} returned error status", url))?;
        Ok(())
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify_restart(&self) -> Result<()> {
        if self.urls.is_empty() {
            info!("No restart webhooks configured");
            return Ok(());
        }
        let event = RestartEvent::now();
        let mut delivered = 0usize;
        for url in &self.urls {
            match self.post(url, &event).await {
                Ok(()) => delivered += 1,
                Err(e) => warn!(%url, error = %format!("{:#}", e), "Restart notification failed"),
            }
        }
        info!(delivered, total = self.urls.len(), "Restart notifications sent");
        Ok(())
    }
}
