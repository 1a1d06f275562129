//! SSE transport for per-query lifecycle events.
//!
//! Each frame is `data: <json>\n\n`; keep-alive comments go out well
//! inside the 30-second contract. The last known event is replayed on
//! connect, the stream closes after a terminal event, and a client
//! disconnect simply drops the channel without touching the
//! orchestration.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use futures_util::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;

use super::api::ApiState;
use super::auth::verify_stream_token;
use crate::lifecycle::{LifecycleEvent, Subscription};

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    #[serde(default)]
    pub token: Option<String>,
}

struct StreamState {
    pending: Option<LifecycleEvent>,
    subscription: Subscription,
    done: bool,
}

fn frame(event: &LifecycleEvent) -> SseEvent {
    match SseEvent::default().json_data(event) {
        Ok(frame) => frame,
        Err(_) => SseEvent::default().data("{}"),
    }
}

fn event_stream(
    subscription: Subscription,
) -> impl Stream<Item = Result<SseEvent, Infallible>> + Send {
    let initial = StreamState {
        pending: subscription.last_event.clone(),
        subscription,
        done: false,
    };
    futures_util::stream::unfold(initial, |mut state| async move {
        if state.done {
            return None;
        }
        if let Some(event) = state.pending.take() {
            state.done = event.state.is_terminal();
            return Some((Ok(frame(&event)), state));
        }
        loop {
            match state.subscription.receiver.recv().await {
                Ok(event) => {
                    state.done = event.state.is_terminal();
                    return Some((Ok(frame(&event)), state));
                }
                Err(RecvError::Lagged(missed)) => {
                    tracing::warn!(missed, "lifecycle stream lagged; dropping events");
                    continue;
                }
                Err(RecvError::Closed) => return None,
            }
        }
    })
}

/// `GET /queries/{id}/stream?token=…`
///
/// SSE cannot attach headers in most clients, so the stream authenticates
/// with a short-lived signed token in the query string (a bearer token
/// known to the verifier is also accepted).
pub async fn stream_lifecycle(
    State(state): State<ApiState>,
    Path(query_id): Path<String>,
    Query(params): Query<StreamParams>,
) -> Response {
    let authorized = params.token.as_deref().is_some_and(|token| {
        verify_stream_token(
            &state.services.settings.hmac_secret,
            &query_id,
            token,
            Utc::now().timestamp(),
        ) || state.verifier.verify(token).is_some()
    });
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            axum::Json(serde_json::json!({
                "error": "unauthorized",
                "detail": "missing or invalid stream token",
            })),
        )
            .into_response();
    }

    let subscription = state.services.lifecycle.subscribe(&query_id).await;
    Sse::new(event_stream(subscription))
        .keep_alive(
            KeepAlive::new()
                .interval(Duration::from_secs(15))
                .text("keep-alive"),
        )
        .into_response()
}
