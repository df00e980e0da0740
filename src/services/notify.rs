use async_trait::async_trait;
use metrics::counter;
use reqwest::Client;
use std::time::Duration;

/// Best-effort delivery of JSON events to caller-supplied URLs.
///
/// Delivery never fails from the caller's point of view: errors are logged
/// and counted, then dropped.
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn deliver(&self, url: &str, payload: serde_json::Value);
}

/// One POST per event, no retry.
pub struct WebhookNotifier {
    http: Client,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = Client::builder().timeout(timeout).build()?;
        Ok(Self { http })
    }
}

#[async_trait]
impl NotificationSink for WebhookNotifier {
    async fn deliver(&self, url: &str, payload: serde_json::Value) {
        match self.http.post(url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!(url, status = %response.status(), "Webhook delivered");
            }
            Ok(response) => {
                counter!("cfdi_notifications_failed_total", "reason" => "status").increment(1);
                tracing::warn!(url, status = %response.status(), "Webhook rejected");
            }
            Err(e) => {
                counter!("cfdi_notifications_failed_total", "reason" => "transport").increment(1);
                tracing::warn!(url, error = %e, "Webhook delivery failed");
            }
        }
    }
}
