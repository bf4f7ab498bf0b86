use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;

use super::{BookingNotice, Notifier};

/// Posts each booking notice as JSON to a fixed URL.
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: String, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build webhook HTTP client")?;
        Ok(Self { url, client })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn visit_booked(&self, notice: &BookingNotice) -> anyhow::Result<()> {
        let body = serde_json::json!({
            "event": "visit.booked",
            "data": notice,
        });

        self.client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .context("failed to send booking webhook")?
            .error_for_status()
            .context("booking webhook returned error")?;

        Ok(())
    }
}
