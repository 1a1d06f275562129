//! Per-query lifecycle fan-out.
//!
//! Each query gets a broadcast channel; subscribers (SSE handlers) receive
//! live events and, on subscribe, an immediate replay of the last known
//! event. The last event is also persisted to the KV store under a
//! retention TTL so clients can reconnect after the in-process channel is
//! gone.
//!
//! Guarantees, per `query_id`:
//! - event timestamps are monotonically non-decreasing;
//! - at most one terminal event is ever published;
//! - a dropped subscriber never blocks or fails the producer.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use super::event::{LifecycleEvent, QueryPhase};
use crate::kv::KvStore;

const CHANNEL_CAPACITY: usize = 256;

fn last_event_key(query_id: &str) -> String {
    format!("qlast:{query_id}")
}

#[derive(Debug)]
struct QueryChannel {
    sender: broadcast::Sender<LifecycleEvent>,
    last: Option<LifecycleEvent>,
    last_timestamp: Option<DateTime<Utc>>,
    terminal_seen: bool,
}

impl QueryChannel {
    fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            last: None,
            last_timestamp: None,
            terminal_seen: false,
        }
    }
}

/// Subscription handle: last known event (replayed) plus the live stream.
pub struct Subscription {
    pub last_event: Option<LifecycleEvent>,
    pub receiver: broadcast::Receiver<LifecycleEvent>,
}

/// Per-query lifecycle event bus.
pub struct LifecycleBus {
    channels: Mutex<FxHashMap<String, QueryChannel>>,
    kv: Arc<dyn KvStore>,
    retention: Duration,
}

impl LifecycleBus {
    #[must_use]
    pub fn new(kv: Arc<dyn KvStore>, retention: Duration) -> Self {
        Self {
            channels: Mutex::new(FxHashMap::default()),
            kv,
            retention,
        }
    }

    /// Publish an event.
    ///
    /// Returns `false` when the event was suppressed because a terminal
    /// event was already published for this query. Timestamps are clamped
    /// so the per-query sequence never goes backwards even if the clock
    /// does.
    pub async fn publish(&self, mut event: LifecycleEvent) -> bool {
        let query_id = event.query_id.clone();
        let stored = {
            let mut channels = self.channels.lock();
            let channel = channels
                .entry(query_id.clone())
                .or_insert_with(QueryChannel::new);
            if channel.terminal_seen {
                tracing::debug!(
                    query_id = %query_id,
                    state = %event.state,
                    "suppressing event after terminal state"
                );
                return false;
            }
            if let Some(last_ts) = channel.last_timestamp {
                if event.timestamp < last_ts {
                    event.timestamp = last_ts;
                }
            }
            channel.last_timestamp = Some(event.timestamp);
            channel.last = Some(event.clone());
            if event.state.is_terminal() {
                channel.terminal_seen = true;
            }
            // No receivers is fine; the last-event replay covers late joins.
            let _ = channel.sender.send(event.clone());
            event
        };

        if let Ok(encoded) = serde_json::to_string(&stored) {
            if let Err(err) = self
                .kv
                .set(&last_event_key(&query_id), encoded, Some(self.retention))
                .await
            {
                tracing::debug!(query_id = %query_id, error = %err, "last-event persist skipped");
            }
        }
        true
    }

    /// Subscribe to a query's lifecycle stream.
    ///
    /// The last known event is replayed immediately (from memory, falling
    /// back to the retained KV copy for reconnects after process restart).
    pub async fn subscribe(&self, query_id: &str) -> Subscription {
        let (last_in_memory, receiver) = {
            let mut channels = self.channels.lock();
            let channel = channels
                .entry(query_id.to_string())
                .or_insert_with(QueryChannel::new);
            (channel.last.clone(), channel.sender.subscribe())
        };
        let last_event = match last_in_memory {
            Some(event) => Some(event),
            None => self.retained_event(query_id).await,
        };
        Subscription {
            last_event,
            receiver,
        }
    }

    /// Last retained event for a query, if any (memory first, then KV).
    pub async fn last_event(&self, query_id: &str) -> Option<LifecycleEvent> {
        if let Some(event) = self
            .channels
            .lock()
            .get(query_id)
            .and_then(|c| c.last.clone())
        {
            return Some(event);
        }
        self.retained_event(query_id).await
    }

    /// Whether a terminal event has been published for this query.
    #[must_use]
    pub fn is_terminal(&self, query_id: &str) -> bool {
        self.channels
            .lock()
            .get(query_id)
            .is_some_and(|c| c.terminal_seen)
    }

    /// Drop in-process channels for terminal queries; retained KV copies
    /// keep serving reconnects. Called periodically by the bootstrap sweep.
    pub fn sweep_terminal(&self) {
        self.channels
            .lock()
            .retain(|_, channel| !(channel.terminal_seen && channel.sender.receiver_count() == 0));
    }

    async fn retained_event(&self, query_id: &str) -> Option<LifecycleEvent> {
        let raw = self.kv.get(&last_event_key(query_id)).await.ok()??;
        serde_json::from_str(&raw).ok()
    }
}

/// Helper composing the usual event shape published by the engine.
pub fn event_with_stage(
    query_id: &str,
    state: QueryPhase,
    stage: &str,
    mut metadata: serde_json::Value,
    trace_id: Option<&str>,
) -> LifecycleEvent {
    if let Some(map) = metadata.as_object_mut() {
        map.entry("stage".to_string())
            .or_insert_with(|| serde_json::Value::String(stage.to_string()));
    }
    LifecycleEvent::new(query_id, state, metadata)
        .with_trace_id(trace_id.map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::InMemoryKv;
    use serde_json::json;

    fn bus() -> LifecycleBus {
        LifecycleBus::new(Arc::new(InMemoryKv::new()), Duration::from_secs(60))
    }

    #[tokio::test]
    async fn publishes_to_live_subscribers() {
        let bus = bus();
        let mut sub = bus.subscribe("q1").await;
        assert!(sub.last_event.is_none());
        bus.publish(LifecycleEvent::new("q1", QueryPhase::Received, json!({})))
            .await;
        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.state, QueryPhase::Received);
    }

    #[tokio::test]
    async fn late_subscriber_gets_last_event() {
        let bus = bus();
        bus.publish(LifecycleEvent::new("q1", QueryPhase::Executing, json!({})))
            .await;
        let sub = bus.subscribe("q1").await;
        assert_eq!(
            sub.last_event.map(|e| e.state),
            Some(QueryPhase::Executing)
        );
    }

    #[tokio::test]
    async fn terminal_is_published_at_most_once() {
        let bus = bus();
        assert!(
            bus.publish(LifecycleEvent::new("q1", QueryPhase::Finished, json!({})))
                .await
        );
        assert!(
            !bus.publish(LifecycleEvent::new("q1", QueryPhase::Error, json!({})))
                .await
        );
        assert!(bus.is_terminal("q1"));
    }

    #[tokio::test]
    async fn timestamps_never_regress() {
        let bus = bus();
        let mut first = LifecycleEvent::new("q1", QueryPhase::Received, json!({}));
        first.timestamp = Utc::now() + chrono::Duration::seconds(10);
        let skewed = first.timestamp;
        bus.publish(first).await;
        bus.publish(LifecycleEvent::new("q1", QueryPhase::Planning, json!({})))
            .await;
        let last = bus.last_event("q1").await.unwrap();
        assert!(last.timestamp >= skewed);
    }

    #[tokio::test]
    async fn reconnect_replays_from_kv_after_sweep() {
        let bus = bus();
        bus.publish(LifecycleEvent::new("q1", QueryPhase::Finished, json!({})))
            .await;
        bus.sweep_terminal();
        let sub = bus.subscribe("q1").await;
        assert_eq!(sub.last_event.map(|e| e.state), Some(QueryPhase::Finished));
    }
}
