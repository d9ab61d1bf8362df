//! Human escalation webhook
//!
//! Fire-and-forget POST to a configured endpoint. A non-2xx answer is
//! logged and never retried; escalation must not block task progress.

use serde::Serialize;
use std::time::Duration;

use tracing::{info, warn};

/// Payload delivered to the escalation endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct EscalationNotice {
    pub item_id: i64,
    pub title: String,
    pub reason: String,
    /// Conversation history, one utterance per line
    pub history: Vec<String>,
    pub escalating_node: String,
}

/// Client for the human escalation webhook.
#[derive(Clone)]
pub struct EscalationClient {
    webhook_url: Option<String>,
    http: reqwest::Client,
}

impl EscalationClient {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            webhook_url,
            http: reqwest::Client::new(),
        }
    }

    /// POST the notice. Failures are logged, never surfaced or retried.
    pub async fn notify(&self, notice: &EscalationNotice) {
        let Some(url) = &self.webhook_url else {
            warn!(
                item_id = notice.item_id,
                "No escalation webhook configured; escalation recorded locally only"
            );
            return;
        };

        let result = self
            .http
            .post(url)
            .json(notice)
            .timeout(Duration::from_secs(10))
            .send()
            .await;

        match result {
            Ok(response) if response.status().is_success() => {
                info!(item_id = notice.item_id, "Escalation delivered");
            }
            Ok(response) => {
                warn!(
                    item_id = notice.item_id,
                    status = response.status().as_u16(),
                    "Escalation webhook returned non-2xx"
                );
            }
            Err(e) => {
                warn!(item_id = notice.item_id, error = %e, "Escalation webhook unreachable");
            }
        }
    }
}
