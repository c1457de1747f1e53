use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

/// Fire-and-forget, best-effort alert delivery. Failures must never
/// propagate into the event loop.
#[async_trait]
pub trait Alerter: Send + Sync {
    async fn alert(&self, message: &str);
}

/// Alerter that only writes to the log.
#[derive(Default)]
pub struct LogAlerter;

#[async_trait]
impl Alerter for LogAlerter {
    async fn alert(&self, message: &str) {
        warn!(alert = true, "{message}");
    }
}

/// Posts alerts to a webhook endpoint. Delivery runs detached so a slow or
/// dead endpoint cannot stall the caller.
pub struct WebhookAlerter {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlerter {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl Alerter for WebhookAlerter {
    async fn alert(&self, message: &str) {
        warn!(alert = true, "{message}");
        let client = self.client.clone();
        let url = self.url.clone();
        let body = serde_json::json!({
            "source": "allocstats",
            "message": message,
        });
        tokio::spawn(async move {
            if let Err(err) = client.post(&url).json(&body).send().await {
                error!("error delivering an alert: {err:?}");
            }
        });
    }
}

pub fn build_alerter(webhook_url: Option<&str>) -> Arc<dyn Alerter> {
    match webhook_url {
        Some(url) => Arc::new(WebhookAlerter::new(url.to_string())),
        None => Arc::new(LogAlerter),
    }
}
