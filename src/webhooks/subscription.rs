//! Webhook subscription storage.
//!
//! Subscriptions live in the KV store under `webhook:{id}`, with a
//! `webhook_user:{user_id}` id-set index for per-user lookup. Delivery
//! attempts update the bookkeeping fields in place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::kv::KvStore;

const KEY_PREFIX: &str = "webhook:";
const USER_INDEX_PREFIX: &str = "webhook_user:";

/// One webhook subscription.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WebhookSubscription {
    pub webhook_id: String,
    pub user_id: String,
    pub url: String,
    /// Event names this subscription wants, or `"*"` for everything.
    #[serde(default)]
    pub events: Vec<String>,
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_delivery_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status_code: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub consecutive_failures: u32,
}

impl WebhookSubscription {
    /// Whether this subscription wants `event`.
    #[must_use]
    pub fn matches(&self, event: &str) -> bool {
        self.active
            && !self.events.is_empty()
            && (self.events.iter().any(|e| e == event) || self.events.iter().any(|e| e == "*"))
    }
}

fn normalize_events(events: Vec<String>) -> Vec<String> {
    let unique: BTreeSet<String> = events
        .into_iter()
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty())
        .collect();
    unique.into_iter().collect()
}

/// CRUD + delivery bookkeeping over the KV store.
pub struct SubscriptionStore {
    kv: Arc<dyn KvStore>,
}

impl SubscriptionStore {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    pub async fn create(
        &self,
        user_id: &str,
        url: &str,
        events: Vec<String>,
        secret: Option<String>,
        active: bool,
    ) -> WebhookSubscription {
        let now = Utc::now();
        let subscription = WebhookSubscription {
            webhook_id: format!("wh_{}", &Uuid::new_v4().simple().to_string()[..16]),
            user_id: user_id.to_string(),
            url: url.to_string(),
            events: normalize_events(events),
            active,
            secret,
            created_at: now,
            updated_at: now,
            last_delivery_at: None,
            last_status_code: None,
            last_error: None,
            consecutive_failures: 0,
        };
        self.persist(&subscription).await;
        let _ = self
            .kv
            .sadd(
                &format!("{USER_INDEX_PREFIX}{user_id}"),
                &subscription.webhook_id,
            )
            .await;
        subscription
    }

    pub async fn get(&self, webhook_id: &str) -> Option<WebhookSubscription> {
        let raw = self
            .kv
            .get(&format!("{KEY_PREFIX}{webhook_id}"))
            .await
            .ok()??;
        serde_json::from_str(&raw).ok()
    }

    /// Update fields of an owned subscription. `None` leaves a field as is.
    pub async fn update(
        &self,
        webhook_id: &str,
        user_id: &str,
        url: Option<String>,
        events: Option<Vec<String>>,
        secret: Option<String>,
        active: Option<bool>,
    ) -> Option<WebhookSubscription> {
        let mut subscription = self.get(webhook_id).await?;
        if subscription.user_id != user_id {
            return None;
        }
        if let Some(url) = url {
            subscription.url = url;
        }
        if let Some(events) = events {
            subscription.events = normalize_events(events);
        }
        if let Some(secret) = secret {
            subscription.secret = Some(secret);
        }
        if let Some(active) = active {
            subscription.active = active;
        }
        subscription.updated_at = Utc::now();
        self.persist(&subscription).await;
        Some(subscription)
    }

    pub async fn delete(&self, webhook_id: &str, user_id: &str) -> bool {
        let Some(subscription) = self.get(webhook_id).await else {
            return false;
        };
        if subscription.user_id != user_id {
            return false;
        }
        let _ = self.kv.delete(&format!("{KEY_PREFIX}{webhook_id}")).await;
        let _ = self
            .kv
            .srem(&format!("{USER_INDEX_PREFIX}{user_id}"), webhook_id)
            .await;
        true
    }

    pub async fn list_for_user(&self, user_id: &str) -> Vec<WebhookSubscription> {
        let ids = self
            .kv
            .smembers(&format!("{USER_INDEX_PREFIX}{user_id}"))
            .await
            .unwrap_or_default();
        let mut subscriptions = Vec::new();
        for id in ids {
            if let Some(sub) = self.get(&id).await {
                if sub.user_id == user_id {
                    subscriptions.push(sub);
                }
            }
        }
        subscriptions
    }

    /// Active subscriptions for a user that match `event`.
    pub async fn list_active_for_event(
        &self,
        user_id: &str,
        event: &str,
    ) -> Vec<WebhookSubscription> {
        self.list_for_user(user_id)
            .await
            .into_iter()
            .filter(|s| s.matches(event))
            .collect()
    }

    /// Record one delivery attempt's outcome.
    pub async fn record_delivery_attempt(
        &self,
        webhook_id: &str,
        status_code: Option<u16>,
        error: Option<String>,
        success: bool,
    ) {
        let Some(mut subscription) = self.get(webhook_id).await else {
            return;
        };
        let now = Utc::now();
        subscription.last_delivery_at = Some(now);
        subscription.last_status_code = status_code;
        subscription.last_error = error;
        subscription.consecutive_failures = if success {
            0
        } else {
            subscription.consecutive_failures + 1
        };
        subscription.updated_at = now;
        self.persist(&subscription).await;
    }

    async fn persist(&self, subscription: &WebhookSubscription) {
        if let Ok(encoded) = serde_json::to_string(subscription) {
            let _ = self
                .kv
                .set(
                    &format!("{KEY_PREFIX}{}", subscription.webhook_id),
                    encoded,
                    None,
                )
                .await;
        }
    }
}
