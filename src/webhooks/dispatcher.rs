//! Webhook delivery: terminal-event fan-out with signed payloads and
//! bounded retries.
//!
//! Deliveries are queued onto a worker task (flume channel); when the
//! queue is unavailable the dispatcher falls back to spawning the
//! delivery in-process so terminal events are still attempted. Each
//! delivery retries up to the configured attempt budget with exponential
//! backoff capped at one hour, recording every attempt on the
//! subscription.

use chrono::Utc;
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use super::signer::sign_payload;
use super::subscription::{SubscriptionStore, WebhookSubscription};
use crate::lifecycle::LifecycleEvent;

pub const EVENT_HEADER: &str = "X-Amila-Event";
pub const DELIVERY_ID_HEADER: &str = "X-Amila-Delivery-Id";
pub const TIMESTAMP_HEADER: &str = "X-Amila-Timestamp";
pub const SIGNATURE_HEADER: &str = "X-Amila-Signature";

/// Rows kept in webhook payload metadata.
const PAYLOAD_ROW_LIMIT: usize = 50;

/// Delivery tuning, usually taken from [`Settings`](crate::config::Settings).
#[derive(Clone, Debug)]
pub struct WebhookConfig {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
    pub request_timeout: Duration,
    /// Fallback secret when a subscription carries none.
    pub default_secret: String,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_base: Duration::from_secs(2),
            backoff_cap: Duration::from_secs(3600),
            request_timeout: Duration::from_secs(10),
            default_secret: "dev-secret-change-me".to_string(),
        }
    }
}

/// One queued delivery.
#[derive(Clone, Debug)]
pub struct DeliveryJob {
    pub webhook_id: String,
    pub url: String,
    pub event: String,
    pub payload: Value,
    pub secret: Option<String>,
}

struct DeliveryContext {
    store: Arc<SubscriptionStore>,
    client: reqwest::Client,
    config: WebhookConfig,
}

impl DeliveryContext {
    /// One HTTP POST: sign, send, classify.
    async fn deliver_once(&self, job: &DeliveryJob, delivery_id: &str) -> (u16, Option<String>) {
        let timestamp = Utc::now().timestamp().to_string();
        let body = match serde_json::to_vec(&job.payload) {
            Ok(body) => body,
            Err(err) => return (0, Some(format!("payload serialization failed: {err}"))),
        };
        let secret = job
            .secret
            .clone()
            .unwrap_or_else(|| self.config.default_secret.clone());
        let signature = sign_payload(secret.trim(), &timestamp, &body);

        let request = self
            .client
            .post(&job.url)
            .header("Content-Type", "application/json")
            .header(EVENT_HEADER, &job.event)
            .header(DELIVERY_ID_HEADER, delivery_id)
            .header(TIMESTAMP_HEADER, &timestamp)
            .header(SIGNATURE_HEADER, &signature)
            .timeout(self.config.request_timeout)
            .body(body);

        match request.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                if (200..300).contains(&status) {
                    (status, None)
                } else {
                    let text = response.text().await.unwrap_or_default();
                    (status, Some(text.chars().take(2000).collect()))
                }
            }
            Err(err) => (0, Some(err.to_string())),
        }
    }

    /// Full delivery with retries; records each attempt.
    async fn deliver_with_retries(&self, job: DeliveryJob) {
        let delivery_id = format!(
            "whd_{}_{}",
            Utc::now().format("%Y%m%d%H%M%S"),
            &Uuid::new_v4().simple().to_string()[..8]
        );
        for attempt in 0..self.config.max_attempts {
            let (status, error) = self.deliver_once(&job, &delivery_id).await;
            let success = (200..300).contains(&status);
            self.store
                .record_delivery_attempt(
                    &job.webhook_id,
                    (status != 0).then_some(status),
                    error.clone(),
                    success,
                )
                .await;
            if success {
                tracing::info!(
                    webhook_id = %job.webhook_id,
                    delivery_id = %delivery_id,
                    attempt = attempt + 1,
                    "webhook delivered"
                );
                return;
            }
            tracing::warn!(
                webhook_id = %job.webhook_id,
                delivery_id = %delivery_id,
                attempt = attempt + 1,
                status,
                error = error.as_deref().unwrap_or(""),
                "webhook delivery failed"
            );
            if attempt + 1 < self.config.max_attempts {
                let delay = self
                    .config
                    .backoff_base
                    .saturating_mul(2u32.saturating_pow(attempt))
                    .min(self.config.backoff_cap);
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Terminal-event fan-out to webhook subscribers.
pub struct WebhookDispatcher {
    context: Arc<DeliveryContext>,
    queue: flume::Sender<DeliveryJob>,
}

impl WebhookDispatcher {
    /// Build the dispatcher and start its delivery worker.
    #[must_use]
    pub fn new(store: Arc<SubscriptionStore>, config: WebhookConfig) -> Arc<Self> {
        let context = Arc::new(DeliveryContext {
            store,
            client: reqwest::Client::new(),
            config,
        });
        let (tx, rx) = flume::unbounded::<DeliveryJob>();
        {
            let context = context.clone();
            tokio::spawn(async move {
                while let Ok(job) = rx.recv_async().await {
                    context.deliver_with_retries(job).await;
                }
            });
        }
        Arc::new(Self { context, queue: tx })
    }

    /// Build the terminal-event payload, truncating oversized row arrays.
    #[must_use]
    pub fn build_terminal_payload(event: &LifecycleEvent) -> Value {
        let mut metadata = event.metadata.clone();
        if let Some(result) = metadata.get_mut("result") {
            if let Some(rows) = result.get_mut("rows").and_then(Value::as_array_mut) {
                if rows.len() > PAYLOAD_ROW_LIMIT {
                    rows.truncate(PAYLOAD_ROW_LIMIT);
                    if let Some(obj) = result.as_object_mut() {
                        obj.insert("truncated".to_string(), Value::Bool(true));
                    }
                }
            }
        }
        json!({
            "query_id": event.query_id,
            "state": event.state,
            "timestamp": event.timestamp,
            "metadata": metadata,
            "emitted_at": Utc::now(),
        })
    }

    /// Fan a terminal event out to every matching subscription of the
    /// owning user. Never fails the caller.
    pub async fn dispatch_terminal(&self, user_id: &str, event: &LifecycleEvent) {
        if user_id.is_empty() {
            return;
        }
        let event_name = event.state.as_str();
        let subscriptions = self
            .context
            .store
            .list_active_for_event(user_id, event_name)
            .await;
        if subscriptions.is_empty() {
            return;
        }
        let payload = Self::build_terminal_payload(event);
        for subscription in subscriptions {
            self.enqueue_or_spawn(DeliveryJob {
                webhook_id: subscription.webhook_id,
                url: subscription.url,
                event: event_name.to_string(),
                payload: payload.clone(),
                secret: subscription.secret,
            });
        }
    }

    /// Send a synthetic test event to one subscription (ownership already
    /// verified by the caller). Returns the final status code, if any
    /// response was received.
    pub async fn send_test(&self, subscription: &WebhookSubscription) -> (u16, Option<String>) {
        let payload = json!({
            "query_id": "test",
            "state": "webhook.test",
            "timestamp": Utc::now(),
            "metadata": {"message": "test delivery"},
            "emitted_at": Utc::now(),
        });
        let job = DeliveryJob {
            webhook_id: subscription.webhook_id.clone(),
            url: subscription.url.clone(),
            event: "webhook.test".to_string(),
            payload,
            secret: subscription.secret.clone(),
        };
        let delivery_id = format!("whd_test_{}", &Uuid::new_v4().simple().to_string()[..8]);
        let (status, error) = self.context.deliver_once(&job, &delivery_id).await;
        self.context
            .store
            .record_delivery_attempt(
                &job.webhook_id,
                (status != 0).then_some(status),
                error.clone(),
                (200..300).contains(&status),
            )
            .await;
        (status, error)
    }

    fn enqueue_or_spawn(&self, job: DeliveryJob) {
        if let Err(flume::TrySendError::Disconnected(job) | flume::TrySendError::Full(job)) =
            self.queue.try_send(job)
        {
            // Queue worker gone: degrade to in-process delivery so the
            // event is still attempted.
            tracing::warn!(
                webhook_id = %job.webhook_id,
                "delivery queue unavailable; delivering in-process"
            );
            let context = self.context.clone();
            tokio::spawn(async move {
                context.deliver_with_retries(job).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::QueryPhase;

    #[test]
    fn terminal_payload_truncates_rows() {
        let rows: Vec<Value> = (0..80).map(|i| json!([i])).collect();
        let event = LifecycleEvent::new(
            "q1",
            QueryPhase::Finished,
            json!({"result": {"rows": rows, "row_count": 80}}),
        );
        let payload = WebhookDispatcher::build_terminal_payload(&event);
        let rows = payload["metadata"]["result"]["rows"].as_array().unwrap();
        assert_eq!(rows.len(), 50);
        assert_eq!(payload["metadata"]["result"]["truncated"], json!(true));
        assert_eq!(payload["state"], json!("finished"));
    }

    #[test]
    fn small_payload_untouched() {
        let event = LifecycleEvent::new(
            "q1",
            QueryPhase::Finished,
            json!({"result": {"rows": [[1], [2]], "row_count": 2}}),
        );
        let payload = WebhookDispatcher::build_terminal_payload(&event);
        assert_eq!(
            payload["metadata"]["result"]["rows"].as_array().unwrap().len(),
            2
        );
        assert!(payload["metadata"]["result"].get("truncated").is_none());
    }
}
