//! Webhook delivery: signed fan-out of terminal events, retries, and
//! delivery bookkeeping, exercised against a local capture server.

mod common;

use axum::Router;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use parking_lot::Mutex;
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use amila::kv::InMemoryKv;
use amila::lifecycle::{LifecycleEvent, QueryPhase};
use amila::webhooks::{
    SubscriptionStore, WebhookConfig, WebhookDispatcher, verify_signature,
};

#[derive(Clone, Debug)]
struct CapturedDelivery {
    event: String,
    delivery_id: String,
    timestamp: String,
    signature: String,
    body: Vec<u8>,
}

#[derive(Clone)]
struct Receiver {
    deliveries: Arc<Mutex<Vec<CapturedDelivery>>>,
    status: StatusCode,
}

async fn capture(
    State(receiver): State<Receiver>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    receiver.deliveries.lock().push(CapturedDelivery {
        event: header("X-Amila-Event"),
        delivery_id: header("X-Amila-Delivery-Id"),
        timestamp: header("X-Amila-Timestamp"),
        signature: header("X-Amila-Signature"),
        body: body.to_vec(),
    });
    receiver.status
}

/// Start a capture server; returns its URL and the delivery log.
async fn start_receiver(status: StatusCode) -> (String, Arc<Mutex<Vec<CapturedDelivery>>>) {
    let deliveries = Arc::new(Mutex::new(Vec::new()));
    let receiver = Receiver {
        deliveries: deliveries.clone(),
        status,
    };
    let app = Router::new()
        .route("/hook", post(capture))
        .with_state(receiver);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/hook"), deliveries)
}

fn dispatcher(store: Arc<SubscriptionStore>, max_attempts: u32) -> Arc<WebhookDispatcher> {
    WebhookDispatcher::new(
        store,
        WebhookConfig {
            max_attempts,
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(50),
            request_timeout: Duration::from_secs(2),
            default_secret: "fallback-secret".to_string(),
        },
    )
}

async fn wait_for<F: Fn() -> bool>(condition: F) {
    for _ in 0..100 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("condition not reached within timeout");
}

#[tokio::test]
async fn terminal_event_is_delivered_signed() {
    let (url, deliveries) = start_receiver(StatusCode::OK).await;
    let store = Arc::new(SubscriptionStore::new(Arc::new(InMemoryKv::new())));
    let subscription = store
        .create("u1", &url, vec!["*".into()], Some("s3cret".into()), true)
        .await;
    let dispatcher = dispatcher(store.clone(), 3);

    let event = LifecycleEvent::new(
        "q-42",
        QueryPhase::Finished,
        json!({"result": {"columns": ["ID"], "rows": [[1]], "row_count": 1}}),
    );
    dispatcher.dispatch_terminal("u1", &event).await;

    wait_for(|| !deliveries.lock().is_empty()).await;
    let delivered = deliveries.lock().first().cloned().unwrap();
    assert_eq!(delivered.event, "finished");
    assert!(delivered.delivery_id.starts_with("whd_"));
    assert!(verify_signature(
        "s3cret",
        &delivered.timestamp,
        &delivered.body,
        &delivered.signature
    ));

    let payload: serde_json::Value = serde_json::from_slice(&delivered.body).unwrap();
    assert_eq!(payload["query_id"], "q-42");
    assert_eq!(payload["state"], "finished");
    assert!(payload["emitted_at"].is_string());

    for _ in 0..100 {
        if store
            .get(&subscription.webhook_id)
            .await
            .is_some_and(|s| s.last_status_code == Some(200))
        {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("delivery bookkeeping never recorded the success");
}

#[tokio::test]
async fn event_filter_excludes_non_matching_subscriptions() {
    let (url, deliveries) = start_receiver(StatusCode::OK).await;
    let store = Arc::new(SubscriptionStore::new(Arc::new(InMemoryKv::new())));
    store
        .create("u1", &url, vec!["error".into()], None, true)
        .await;
    let dispatcher = dispatcher(store, 1);

    let event = LifecycleEvent::new("q-1", QueryPhase::Finished, json!({}));
    dispatcher.dispatch_terminal("u1", &event).await;

    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(deliveries.lock().is_empty());
}

#[tokio::test]
async fn failed_delivery_retries_and_records_failures() {
    let (url, deliveries) = start_receiver(StatusCode::INTERNAL_SERVER_ERROR).await;
    let store = Arc::new(SubscriptionStore::new(Arc::new(InMemoryKv::new())));
    let subscription = store.create("u1", &url, vec!["*".into()], None, true).await;
    let dispatcher = dispatcher(store.clone(), 3);

    let event = LifecycleEvent::new("q-2", QueryPhase::Error, json!({"error": "boom"}));
    dispatcher.dispatch_terminal("u1", &event).await;

    wait_for(|| deliveries.lock().len() >= 3).await;
    // One failure recorded per attempt, never reset.
    let mut failures_seen = 0;
    for _ in 0..100 {
        failures_seen = store
            .get(&subscription.webhook_id)
            .await
            .map_or(0, |s| s.consecutive_failures);
        if failures_seen >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(failures_seen >= 3, "expected 3 recorded failures");
    let sub = store.get(&subscription.webhook_id).await.unwrap();
    assert_eq!(sub.last_status_code, Some(500));
    assert!(sub.last_delivery_at.is_some());
}

#[tokio::test]
async fn inactive_subscriptions_are_skipped() {
    let (url, deliveries) = start_receiver(StatusCode::OK).await;
    let store = Arc::new(SubscriptionStore::new(Arc::new(InMemoryKv::new())));
    let subscription = store.create("u1", &url, vec!["*".into()], None, true).await;
    store
        .update(
            &subscription.webhook_id,
            "u1",
            None,
            None,
            None,
            Some(false),
        )
        .await
        .unwrap();
    let dispatcher = dispatcher(store, 1);

    let event = LifecycleEvent::new("q-3", QueryPhase::Finished, json!({}));
    dispatcher.dispatch_terminal("u1", &event).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(deliveries.lock().is_empty());
}

#[tokio::test]
async fn test_delivery_uses_synthetic_event() {
    let (url, deliveries) = start_receiver(StatusCode::OK).await;
    let store = Arc::new(SubscriptionStore::new(Arc::new(InMemoryKv::new())));
    let subscription = store.create("u1", &url, vec!["finished".into()], None, true).await;
    let dispatcher = dispatcher(store, 1);

    let (status, error) = dispatcher.send_test(&subscription).await;
    assert_eq!(status, 200);
    assert_eq!(error, None);
    let delivered = deliveries.lock().first().cloned().unwrap();
    assert_eq!(delivered.event, "webhook.test");
}
