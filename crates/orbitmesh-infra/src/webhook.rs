//! Webhook notifier: delivers Notify-step messages as JSON POSTs.

use std::time::Duration;

use orbitmesh_core::notify::{Notifier, NotifyError};

/// Notifier implementation that POSTs `{"message": ...}` to the target URL.
///
/// The engine wraps calls in its own notifier deadline as well; the client
/// timeout here bounds a single HTTP exchange.
pub struct WebhookNotifier {
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(timeout: Duration) -> Result<Self, NotifyError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;
        Ok(Self { client })
    }
}

impl Notifier for WebhookNotifier {
    async fn notify(&self, target: &str, message: &str) -> Result<(), NotifyError> {
        let response = self
            .client
            .post(target)
            .json(&serde_json::json!({ "message": message }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    NotifyError::Timeout
                } else {
                    NotifyError::Delivery(e.to_string())
                }
            })?;

        if response.status().is_success() {
            tracing::debug!(target, "notification delivered");
            Ok(())
        } else {
            Err(NotifyError::Delivery(format!(
                "webhook returned {}",
                response.status()
            )))
        }
    }
}
