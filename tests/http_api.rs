//! HTTP surface tests: auth, canonical response bodies, approval flow,
//! large-result indirection, webhook CRUD, and the SSE stream.

mod common;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use serde_json::{Value, json};
use std::sync::Arc;
use tower::util::ServiceExt;

use common::{ScriptedAdapter, ScriptedLlm, test_context, wide_result};

use amila::http::auth::{AuthUser, StaticTokenVerifier};
use amila::http::{ApiState, router};
use amila::types::DatabaseType;

const TOKEN: &str = "test-token";

struct Harness {
    app: Router,
    state: ApiState,
}

fn harness(llm: Arc<ScriptedLlm>, adapter: Arc<ScriptedAdapter>) -> Harness {
    let context = test_context(llm, adapter);
    let verifier = Arc::new(StaticTokenVerifier::new());
    verifier.insert(
        TOKEN,
        AuthUser {
            user_id: "u1".to_string(),
            role: "analyst".to_string(),
        },
    );
    let state = context.api_state(verifier, false);
    Harness {
        app: router(state.clone()),
        state,
    }
}

async fn call(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 10 * 1024 * 1024)
        .await
        .unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, body)
}

fn post_json(path: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(path)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

fn get(path: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(path)
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .body(Body::empty())
        .unwrap()
}

#[tokio::test]
async fn health_is_public_and_healthy() {
    let h = harness(ScriptedLlm::new(), ScriptedAdapter::new(DatabaseType::Oracle));
    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let (status, body) = call(&h.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "healthy");
}

#[tokio::test]
async fn missing_bearer_token_is_rejected() {
    let h = harness(ScriptedLlm::new(), ScriptedAdapter::new(DatabaseType::Oracle));
    let request = Request::builder()
        .method("POST")
        .uri("/queries/process")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let (status, body) = call(&h.app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");
}

#[tokio::test]
async fn process_then_approve_round_trip() {
    let h = harness(ScriptedLlm::new(), ScriptedAdapter::new(DatabaseType::Oracle));

    let (status, body) = call(
        &h.app,
        post_json(
            "/queries/process",
            json!({
                "query": "Show a tiny sample from any safe table.",
                "database_type": "oracle",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending_approval");
    assert_eq!(body["needs_approval"], json!(true));
    assert!(body["sql_query"].as_str().unwrap().contains("SELECT"));
    assert!(body["validation"]["is_valid"].as_bool().unwrap());
    let query_id = body["query_id"].as_str().unwrap().to_string();

    let (status, body) = call(
        &h.app,
        post_json(
            &format!("/queries/{query_id}/approve"),
            json!({"approved": true}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    let results = &body["results"];
    let columns: Vec<String> = results["columns"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c.as_str().unwrap().to_string())
        .collect();
    assert_eq!(columns, vec!["ID".to_string(), "NAME".to_string()]);
    assert_eq!(
        results["row_count"].as_u64().unwrap() as usize,
        results["rows"].as_array().unwrap().len()
    );
}

#[tokio::test]
async fn rejection_reports_approval_rejected() {
    let h = harness(ScriptedLlm::new(), ScriptedAdapter::new(DatabaseType::Oracle));
    let (_, body) = call(
        &h.app,
        post_json(
            "/queries/process",
            json!({"query": "Show a tiny sample.", "database_type": "oracle"}),
        ),
    )
    .await;
    let query_id = body["query_id"].as_str().unwrap().to_string();

    let (status, body) = call(
        &h.app,
        post_json(
            &format!("/queries/{query_id}/approve"),
            json!({"approved": false, "reason": "no"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "error");
    assert!(
        body["error"]
            .as_str()
            .unwrap()
            .starts_with("approval_rejected")
    );
}

#[tokio::test]
async fn large_results_return_preview_and_reference() {
    let adapter = ScriptedAdapter::new(DatabaseType::Oracle);
    adapter.push_execution(Ok(wide_result(500)));
    let h = harness(ScriptedLlm::new(), adapter);

    let (_, body) = call(
        &h.app,
        post_json(
            "/queries/process",
            json!({"query": "Show everything.", "database_type": "oracle"}),
        ),
    )
    .await;
    let query_id = body["query_id"].as_str().unwrap().to_string();
    let (_, body) = call(
        &h.app,
        post_json(
            &format!("/queries/{query_id}/approve"),
            json!({"approved": true}),
        ),
    )
    .await;

    assert_eq!(body["status"], "success");
    assert_eq!(body["results"]["rows"].as_array().unwrap().len(), 50);
    assert_eq!(body["results"]["row_count"], json!(500));
    assert_eq!(body["result_ref"]["row_count"], json!(500));
    assert_eq!(body["result_ref"]["query_id"].as_str().unwrap(), query_id);

    // The full rows stay fetchable through the reference path.
    let full = h
        .state
        .services
        .results
        .fetch_by_query_id(&query_id)
        .await
        .unwrap();
    assert_eq!(full.rows.len(), 500);
}

#[tokio::test]
async fn empty_clarification_is_bad_request() {
    let llm = ScriptedLlm::new();
    llm.push_sql_response(ScriptedLlm::clarification_envelope("Which range?"));
    let h = harness(llm, ScriptedAdapter::new(DatabaseType::Oracle));

    let (_, body) = call(
        &h.app,
        post_json(
            "/queries/process",
            json!({"query": "Show the usual.", "database_type": "oracle"}),
        ),
    )
    .await;
    assert_eq!(body["status"], "pending_clarification");
    let query_id = body["query_id"].as_str().unwrap().to_string();

    let (status, _) = call(
        &h.app,
        post_json(
            "/queries/clarify",
            json!({"query_id": query_id, "clarification": "  "}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = call(
        &h.app,
        post_json(
            "/queries/clarify",
            json!({"query_id": query_id, "clarification": "last 7 days"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "pending_approval");
}

#[tokio::test]
async fn direct_sql_submission_executes() {
    let h = harness(ScriptedLlm::new(), ScriptedAdapter::new(DatabaseType::Oracle));
    let (status, body) = call(
        &h.app,
        post_json(
            "/queries/submit",
            json!({
                "sql": "SELECT ID FROM CUSTOMER_DATA FETCH FIRST 3 ROWS ONLY",
                "database_type": "oracle",
            }),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["results"]["row_count"], json!(3));
}

#[tokio::test]
async fn direct_sql_submission_rejects_writes() {
    let h = harness(ScriptedLlm::new(), ScriptedAdapter::new(DatabaseType::Oracle));
    let (status, body) = call(
        &h.app,
        post_json(
            "/queries/submit",
            json!({"sql": "DELETE FROM CUSTOMER_DATA", "database_type": "oracle"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "error");
}

#[tokio::test]
async fn schema_endpoint_returns_tables() {
    let h = harness(ScriptedLlm::new(), ScriptedAdapter::new(DatabaseType::Oracle));
    let (status, body) = call(&h.app, get("/schema?database_type=oracle")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert!(body["schema_data"]["tables"]["CUSTOMER_DATA"].is_array());
}

#[tokio::test]
async fn webhook_crud_lifecycle() {
    let h = harness(ScriptedLlm::new(), ScriptedAdapter::new(DatabaseType::Oracle));

    let (status, body) = call(
        &h.app,
        post_json(
            "/webhooks",
            json!({"url": "https://example.com/hook", "events": ["*"]}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    let webhook_id = body["webhook_id"].as_str().unwrap().to_string();

    let (status, body) = call(&h.app, get("/webhooks")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["webhooks"].as_array().unwrap().len(), 1);

    let request = Request::builder()
        .method("PUT")
        .uri(format!("/webhooks/{webhook_id}"))
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(
            json!({"url": "https://example.com/hook2", "events": ["finished"], "active": false})
                .to_string(),
        ))
        .unwrap();
    let (status, body) = call(&h.app, request).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["active"], json!(false));
    assert_eq!(body["url"], "https://example.com/hook2");

    let request = Request::builder()
        .method("DELETE")
        .uri(format!("/webhooks/{webhook_id}"))
        .header(header::AUTHORIZATION, format!("Bearer {TOKEN}"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = call(&h.app, request).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
}

#[tokio::test]
async fn invalid_webhook_url_is_rejected() {
    let h = harness(ScriptedLlm::new(), ScriptedAdapter::new(DatabaseType::Oracle));
    let (status, _) = call(
        &h.app,
        post_json("/webhooks", json!({"url": "ftp://nope", "events": ["*"]})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn stream_requires_token_and_replays_terminal_state() {
    let h = harness(ScriptedLlm::new(), ScriptedAdapter::new(DatabaseType::Oracle));

    let (_, body) = call(
        &h.app,
        post_json(
            "/queries/process",
            json!({"query": "Show a tiny sample.", "database_type": "oracle"}),
        ),
    )
    .await;
    let query_id = body["query_id"].as_str().unwrap().to_string();
    let stream_token = body["stream_token"].as_str().unwrap().to_string();
    call(
        &h.app,
        post_json(
            &format!("/queries/{query_id}/approve"),
            json!({"approved": true}),
        ),
    )
    .await;

    // No token: 401.
    let request = Request::builder()
        .uri(format!("/queries/{query_id}/stream"))
        .body(Body::empty())
        .unwrap();
    let (status, _) = call(&h.app, request).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Reconnect after terminal: the last state is replayed immediately and
    // the stream closes after the terminal event.
    let request = Request::builder()
        .uri(format!("/queries/{query_id}/stream?token={stream_token}"))
        .body(Body::empty())
        .unwrap();
    let response = h.app.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = tokio::time::timeout(
        std::time::Duration::from_secs(5),
        axum::body::to_bytes(response.into_body(), 1024 * 1024),
    )
    .await
    .expect("stream closes after terminal event")
    .unwrap();
    let text = String::from_utf8_lossy(&bytes);
    assert!(text.contains("data:"));
    assert!(text.contains("\"state\":\"finished\""));
}
