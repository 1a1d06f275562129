//! Lifecycle events: structured status transitions for one query,
//! published to SSE subscribers and fanned out to webhooks on terminal
//! states.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Lifecycle phase of a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryPhase {
    Received,
    Planning,
    GeneratingSql,
    Validating,
    PendingApproval,
    Approved,
    Executing,
    ValidatingResults,
    Finished,
    Error,
    Rejected,
}

impl QueryPhase {
    /// Wire name, matching the SSE and webhook payloads.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            QueryPhase::Received => "received",
            QueryPhase::Planning => "planning",
            QueryPhase::GeneratingSql => "generating_sql",
            QueryPhase::Validating => "validating",
            QueryPhase::PendingApproval => "pending_approval",
            QueryPhase::Approved => "approved",
            QueryPhase::Executing => "executing",
            QueryPhase::ValidatingResults => "validating_results",
            QueryPhase::Finished => "finished",
            QueryPhase::Error => "error",
            QueryPhase::Rejected => "rejected",
        }
    }

    /// Terminal phases close the stream and trigger webhook fan-out.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            QueryPhase::Finished | QueryPhase::Error | QueryPhase::Rejected
        )
    }
}

impl fmt::Display for QueryPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One status transition for one query.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct LifecycleEvent {
    pub query_id: String,
    pub state: QueryPhase,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
}

impl LifecycleEvent {
    #[must_use]
    pub fn new(query_id: &str, state: QueryPhase, metadata: Value) -> Self {
        Self {
            query_id: query_id.to_string(),
            state,
            timestamp: Utc::now(),
            metadata,
            trace_id: None,
        }
    }

    #[must_use]
    pub fn with_trace_id(mut self, trace_id: Option<String>) -> Self {
        self.trace_id = trace_id;
        self
    }

    /// Render the SSE frame for this event: `data: {json}\n\n`.
    #[must_use]
    pub fn to_sse_frame(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        format!("data: {json}\n\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn phases_serialize_snake_case() {
        let event = LifecycleEvent::new("q1", QueryPhase::GeneratingSql, json!({}));
        let encoded = serde_json::to_value(&event).unwrap();
        assert_eq!(encoded["state"], "generating_sql");
        assert_eq!(encoded["query_id"], "q1");
    }

    #[test]
    fn terminal_classification() {
        assert!(QueryPhase::Finished.is_terminal());
        assert!(QueryPhase::Error.is_terminal());
        assert!(QueryPhase::Rejected.is_terminal());
        assert!(!QueryPhase::Executing.is_terminal());
    }

    #[test]
    fn sse_frame_shape() {
        let event = LifecycleEvent::new("q1", QueryPhase::Executing, json!({"stage": "execute"}));
        let frame = event.to_sse_frame();
        assert!(frame.starts_with("data: {"));
        assert!(frame.ends_with("\n\n"));
    }
}
