//! Slack webhook alerts for operational failures.

use tracing::{debug, warn};

/// Posts plain-text messages to a Slack incoming webhook. A missing
/// webhook URL turns every alert into a no-op.
#[derive(Clone)]
pub struct SlackAlerter {
    http: reqwest::Client,
    webhook_url: Option<String>,
}

impl SlackAlerter {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            webhook_url,
        }
    }

    pub fn disabled() -> Self {
        Self::new(None)
    }

    /// Delivery failures are logged, never propagated. An alert must not
    /// take down the operation it reports on.
    pub async fn send(&self, message: &str) {
        let Some(url) = &self.webhook_url else {
            debug!("Slack alerting disabled, dropping alert");
            return;
        };

        let payload = serde_json::json!({ "text": message });

        match self.http.post(url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {}
            Ok(response) => {
                warn!(status = %response.status(), "Slack webhook rejected alert");
            }
            Err(e) => {
                warn!(error = %e, "Failed to deliver Slack alert");
            }
        }
    }
}
