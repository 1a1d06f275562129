//! HTTP API surface.
//!
//! All endpoints answer JSON. The query-processing endpoints always
//! answer 200 with failures encoded in the body; infrastructure concerns
//! (auth, CSRF, signatures, upstream outages) use status-code semantics:
//! 401 auth, 403 CSRF/signature, 404 unknown ids, 502 upstream, 503
//! breaker open.

use axum::body::{Body, to_bytes};
use axum::extract::{Path, Query, State};
use axum::http::{Method, Request, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Extension, Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use super::auth::{
    AuthUser, CSRF_COOKIE_NAME, CSRF_HEADER_NAME, SIGNATURE_HEADER, SIGNATURE_TIMESTAMP_HEADER,
    TokenVerifier, issue_stream_token, validate_csrf_pair, verify_request_signature,
};
use super::sse::stream_lifecycle;
use crate::approval::{ApprovalDecision, ApprovalError, ApprovalGate};
use crate::db::DbErrorKind;
use crate::engine::{EngineError, Orchestrator, RunOutcome, RunStatus, SubmitRequest};
use crate::node::Services;
use crate::nodes::validate::basic_sql_checks;
use crate::resilience::{BreakerRegistry, CircuitState};
use crate::results::ResultReference;
use crate::state::{ExecutionResult, LlmMetadata, ValidationReport};
use crate::types::DatabaseType;
use crate::webhooks::{SubscriptionStore, WebhookDispatcher};

/// Shared state for the router.
#[derive(Clone)]
pub struct ApiState {
    pub engine: Arc<Orchestrator>,
    pub gate: Arc<ApprovalGate>,
    pub services: Arc<Services>,
    pub subscriptions: Arc<SubscriptionStore>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub verifier: Arc<dyn TokenVerifier>,
    pub breakers: Arc<BreakerRegistry>,
    /// Disable to run without CSRF/signature checks (tests, local dev).
    pub csrf_enforced: bool,
}

/// Canonical response body for query processing.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct OrchestratorQueryResponse {
    pub query_id: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<ResultReference>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub needs_approval: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub llm_metadata: Option<LlmMetadata>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Short-lived token for the SSE stream endpoint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_token: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ProcessRequest {
    pub query: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    pub database_type: String,
    #[serde(default)]
    pub connection_name: Option<String>,
    #[serde(default)]
    pub thread_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SubmitSqlRequest {
    pub sql: String,
    pub database_type: String,
    #[serde(default)]
    pub connection_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ClarifyRequest {
    pub query_id: String,
    pub clarification: String,
    #[serde(default)]
    pub original_query: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApproveRequest {
    pub approved: bool,
    #[serde(default)]
    pub edited_sql: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct SchemaParams {
    pub database_type: String,
    #[serde(default)]
    pub connection_name: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct WebhookBody {
    pub url: String,
    #[serde(default)]
    pub events: Vec<String>,
    #[serde(default)]
    pub secret: Option<String>,
    #[serde(default)]
    pub active: Option<bool>,
}

/// Build the service router with auth + write-protection middleware.
pub fn router(state: ApiState) -> Router {
    let protected = Router::new()
        .route("/queries/process", post(process_query))
        .route("/queries/submit", post(submit_sql))
        .route("/queries/clarify", post(clarify_query))
        .route("/queries/{id}/approve", post(approve_query))
        .route("/schema", get(get_schema))
        .route("/webhooks", post(create_webhook).get(list_webhooks))
        .route("/webhooks/{id}", put(update_webhook).delete(delete_webhook))
        .route("/webhooks/{id}/test", post(test_webhook))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            write_protections,
        ))
        .layer(middleware::from_fn_with_state(state.clone(), require_auth));

    Router::new()
        .route("/health", get(health))
        .route("/queries/{id}/stream", get(stream_lifecycle))
        .merge(protected)
        .with_state(state)
}

fn error_body(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({"error": code, "detail": message})),
    )
        .into_response()
}

async fn require_auth(
    State(state): State<ApiState>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    let Some(user) = token.and_then(|t| state.verifier.verify(t)) else {
        return error_body(
            StatusCode::UNAUTHORIZED,
            "unauthorized",
            "missing or invalid bearer token",
        );
    };
    request.extensions_mut().insert(user);
    next.run(request).await
}

/// CSRF double-submit + request signature for unsafe methods.
async fn write_protections(
    State(state): State<ApiState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    if !state.csrf_enforced
        || !matches!(
            *request.method(),
            Method::POST | Method::PUT | Method::DELETE | Method::PATCH
        )
    {
        return next.run(request).await;
    }

    let secret = state.services.settings.hmac_secret.clone();
    let cookie_token = request
        .headers()
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())
        .and_then(|cookies| {
            cookies.split(';').find_map(|pair| {
                let (name, value) = pair.trim().split_once('=')?;
                (name == CSRF_COOKIE_NAME).then(|| value.to_string())
            })
        });
    let header_token = request
        .headers()
        .get(CSRF_HEADER_NAME)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let (Some(cookie_token), Some(header_token)) = (cookie_token, header_token) else {
        return error_body(
            StatusCode::FORBIDDEN,
            "csrf_validation_failed",
            "missing CSRF token pair",
        );
    };
    if !validate_csrf_pair(&cookie_token, &header_token, &secret) {
        return error_body(
            StatusCode::FORBIDDEN,
            "csrf_validation_failed",
            "CSRF token mismatch",
        );
    }

    let signature = request
        .headers()
        .get(SIGNATURE_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let timestamp = request
        .headers()
        .get(SIGNATURE_TIMESTAMP_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let (Some(signature), Some(timestamp)) = (signature, timestamp) else {
        return error_body(
            StatusCode::FORBIDDEN,
            "signature_missing",
            "request signature headers required",
        );
    };

    let method = request.method().as_str().to_string();
    let path = request.uri().path().to_string();
    let (parts, body) = request.into_parts();
    let bytes = match to_bytes(body, 2 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_body(
                StatusCode::PAYLOAD_TOO_LARGE,
                "body_too_large",
                "request body exceeds limit",
            );
        }
    };
    if !verify_request_signature(
        &secret,
        &method,
        &path,
        &timestamp,
        &bytes,
        &signature,
        Utc::now().timestamp(),
    ) {
        return error_body(
            StatusCode::FORBIDDEN,
            "signature_invalid",
            "request signature invalid or outside the timestamp window",
        );
    }
    let request = Request::from_parts(parts, Body::from(bytes));
    next.run(request).await
}

/// Translate a run outcome into the canonical response body.
fn build_response(state: &ApiState, thread_id: Option<String>, outcome: RunOutcome) -> OrchestratorQueryResponse {
    let settings = &state.services.settings;
    let query_state = outcome.state;
    let (status, error) = match outcome.status {
        RunStatus::Finished => ("success".to_string(), None),
        RunStatus::PendingApproval => ("pending_approval".to_string(), None),
        RunStatus::PendingClarification => ("pending_clarification".to_string(), None),
        RunStatus::Rejected => (
            "error".to_string(),
            Some(format!(
                "approval_rejected: {}",
                query_state
                    .rejection_reason
                    .clone()
                    .unwrap_or_else(|| "rejected by user".to_string())
            )),
        ),
        RunStatus::Failed | RunStatus::InProgress => (
            "error".to_string(),
            query_state
                .error
                .clone()
                .or_else(|| Some("query failed".to_string())),
        ),
    };

    let (results, result_ref) = match &query_state.execution_result {
        Some(result) if outcome.status == RunStatus::Finished => {
            let payload =
                state
                    .services
                    .results
                    .transport_payload(&query_state.query_id, result, None);
            (Some(payload.results), payload.result_ref)
        }
        _ => (None, None),
    };

    let stream_token = issue_stream_token(
        &settings.hmac_secret,
        &query_state.query_id,
        Utc::now().timestamp() + settings.lifecycle_retention.as_secs() as i64,
    );

    OrchestratorQueryResponse {
        query_id: query_state.query_id.clone(),
        status,
        sql_query: (!query_state.sql_query.is_empty()).then(|| query_state.sql_query.clone()),
        results,
        result_ref,
        validation: query_state.validation_result.clone(),
        needs_approval: Some(query_state.needs_approval),
        llm_metadata: Some(query_state.llm_metadata.clone()),
        clarification_message: query_state.clarification_message.clone(),
        error,
        trace_id: query_state.trace_id.clone(),
        thread_id,
        stream_token: Some(stream_token),
    }
}

fn engine_error_response(err: &EngineError) -> OrchestratorQueryResponse {
    OrchestratorQueryResponse {
        query_id: String::new(),
        status: "error".to_string(),
        sql_query: None,
        results: None,
        result_ref: None,
        validation: None,
        needs_approval: None,
        llm_metadata: None,
        clarification_message: None,
        error: Some(err.to_string()),
        trace_id: None,
        thread_id: None,
        stream_token: None,
    }
}

async fn process_query(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<ProcessRequest>,
) -> Json<OrchestratorQueryResponse> {
    let request = SubmitRequest {
        query: body.query,
        user_id: body.user_id.or(Some(user.user_id)),
        user_role: Some(user.role),
        session_id: body.session_id,
        database_type: DatabaseType::parse_or_default(&body.database_type),
        connection_name: body.connection_name,
        thread_id: body.thread_id,
    };
    match state.engine.submit(request).await {
        Ok(outcome) => {
            let thread_id = Some(outcome.state.thread_id.clone());
            Json(build_response(&state, thread_id, outcome))
        }
        Err(err) => {
            tracing::error!(error = %err, "query submission failed");
            Json(engine_error_response(&err))
        }
    }
}

async fn submit_sql(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<SubmitSqlRequest>,
) -> Json<Value> {
    let database = DatabaseType::parse_or_default(&body.database_type);
    let query_id = uuid::Uuid::new_v4().to_string();
    if let Err(problem) = basic_sql_checks(&body.sql) {
        return Json(json!({
            "query_id": query_id,
            "status": "error",
            "error": problem,
            "database_type": database,
        }));
    }
    let report = state
        .services
        .database
        .execute_to_report(
            database,
            &body.sql,
            body.connection_name.as_deref(),
            Some(&user.user_id),
            &query_id,
            None,
        )
        .await;
    if let Some(result) = &report.results {
        state
            .services
            .results
            .store(&query_id, &body.sql, database, result)
            .await;
        let payload = state
            .services
            .results
            .transport_payload(&query_id, result, None);
        return Json(json!({
            "query_id": query_id,
            "status": report.status,
            "results": payload.results,
            "result_ref": payload.result_ref,
            "database_type": database,
        }));
    }
    Json(serde_json::to_value(&report).unwrap_or_else(|_| json!({"status": "error"})))
}

async fn clarify_query(
    State(state): State<ApiState>,
    Json(body): Json<ClarifyRequest>,
) -> Response {
    if body.clarification.trim().is_empty() {
        return error_body(
            StatusCode::BAD_REQUEST,
            "empty_clarification",
            "clarification must not be empty",
        );
    }
    let Some(thread_id) = state.engine.thread_for_query(&body.query_id).await else {
        return error_body(StatusCode::NOT_FOUND, "unknown_query", "unknown query_id");
    };
    match state.gate.clarify(&thread_id, &body.clarification).await {
        Ok(outcome) => Json(build_response(&state, Some(thread_id), outcome)).into_response(),
        Err(ApprovalError::EmptyClarification) => error_body(
            StatusCode::BAD_REQUEST,
            "empty_clarification",
            "clarification must not be empty",
        ),
        Err(err) => error_body(StatusCode::BAD_GATEWAY, "clarify_failed", &err.to_string()),
    }
}

async fn approve_query(
    State(state): State<ApiState>,
    Path(query_id): Path<String>,
    Json(body): Json<ApproveRequest>,
) -> Response {
    let Some(thread_id) = state.engine.thread_for_query(&query_id).await else {
        return error_body(StatusCode::NOT_FOUND, "unknown_query", "unknown query_id");
    };
    let decision = ApprovalDecision {
        approved: body.approved,
        edited_sql: body.edited_sql,
        reason: body.reason,
    };
    match state.gate.decide(&thread_id, decision).await {
        Ok(outcome) => Json(build_response(&state, Some(thread_id), outcome)).into_response(),
        Err(ApprovalError::Engine(EngineError::NotPendingApproval(_))) => error_body(
            StatusCode::CONFLICT,
            "not_pending_approval",
            "query is not awaiting approval",
        ),
        Err(ApprovalError::Engine(EngineError::UnknownThread(_))) => {
            error_body(StatusCode::NOT_FOUND, "unknown_query", "unknown query_id")
        }
        Err(err) => error_body(StatusCode::BAD_GATEWAY, "approve_failed", &err.to_string()),
    }
}

async fn get_schema(
    State(state): State<ApiState>,
    Query(params): Query<SchemaParams>,
) -> Response {
    let database = DatabaseType::parse_or_default(&params.database_type);
    match state
        .services
        .database
        .get_schema(database, "", params.connection_name.as_deref())
        .await
    {
        Ok(schema) => Json(json!({
            "status": "success",
            "schema_data": schema,
        }))
        .into_response(),
        Err(err) if err.kind == DbErrorKind::CircuitOpen => error_body(
            StatusCode::SERVICE_UNAVAILABLE,
            "circuit_open",
            &err.to_string(),
        ),
        Err(err) => error_body(StatusCode::BAD_GATEWAY, "schema_failed", &err.to_string()),
    }
}

async fn create_webhook(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthUser>,
    Json(body): Json<WebhookBody>,
) -> Response {
    if !body.url.starts_with("http://") && !body.url.starts_with("https://") {
        return error_body(
            StatusCode::BAD_REQUEST,
            "invalid_url",
            "webhook url must be http(s)",
        );
    }
    let subscription = state
        .subscriptions
        .create(
            &user.user_id,
            &body.url,
            body.events,
            body.secret,
            body.active.unwrap_or(true),
        )
        .await;
    (StatusCode::CREATED, Json(subscription)).into_response()
}

async fn list_webhooks(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthUser>,
) -> Response {
    let subscriptions = state.subscriptions.list_for_user(&user.user_id).await;
    Json(json!({"webhooks": subscriptions})).into_response()
}

async fn update_webhook(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthUser>,
    Path(webhook_id): Path<String>,
    Json(body): Json<WebhookBody>,
) -> Response {
    match state
        .subscriptions
        .update(
            &webhook_id,
            &user.user_id,
            Some(body.url),
            Some(body.events),
            body.secret,
            body.active,
        )
        .await
    {
        Some(subscription) => Json(subscription).into_response(),
        None => error_body(StatusCode::NOT_FOUND, "unknown_webhook", "unknown webhook id"),
    }
}

async fn delete_webhook(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthUser>,
    Path(webhook_id): Path<String>,
) -> Response {
    if state.subscriptions.delete(&webhook_id, &user.user_id).await {
        StatusCode::NO_CONTENT.into_response()
    } else {
        error_body(StatusCode::NOT_FOUND, "unknown_webhook", "unknown webhook id")
    }
}

async fn test_webhook(
    State(state): State<ApiState>,
    Extension(user): Extension<AuthUser>,
    Path(webhook_id): Path<String>,
) -> Response {
    let Some(subscription) = state.subscriptions.get(&webhook_id).await else {
        return error_body(StatusCode::NOT_FOUND, "unknown_webhook", "unknown webhook id");
    };
    if subscription.user_id != user.user_id {
        return error_body(StatusCode::NOT_FOUND, "unknown_webhook", "unknown webhook id");
    }
    let (status_code, error) = state.dispatcher.send_test(&subscription).await;
    Json(json!({
        "status": if (200..300).contains(&status_code) { "success" } else { "error" },
        "status_code": status_code,
        "error": error,
    }))
    .into_response()
}

async fn health(State(state): State<ApiState>) -> Json<Value> {
    // KV reachability probe.
    let kv_ok = state
        .services
        .kv
        .set("health:probe", "ok".to_string(), None)
        .await
        .is_ok()
        && matches!(
            state.services.kv.get("health:probe").await,
            Ok(Some(ref v)) if v == "ok"
        );
    let breakers = state.breakers.snapshots();
    let any_open = breakers.iter().any(|b| b.state == CircuitState::Open);
    let status = if kv_ok && !any_open {
        "healthy"
    } else {
        "degraded"
    };
    Json(json!({
        "status": status,
        "kv": if kv_ok { "ok" } else { "unreachable" },
        "circuit_breakers": breakers,
        "timestamp": Utc::now(),
    }))
}
