//! Intent understanding: the first node every query passes through.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::llm::parse_json_response;
use crate::message::Message;
use crate::node::{Node, NodeContext, NodeError, Transition};
use crate::state::{NodeStatus, QueryState, ThinkingStep};
use crate::types::NodeKind;

/// Stable message returned for an empty submission.
pub const EMPTY_QUERY_MESSAGE: &str = "Query cannot be empty. Please provide a question.";
/// Stable message returned for write/DDL intent.
pub const BLOCKED_QUERY_MESSAGE: &str =
    "Only read-only queries are supported. Data modification requests are blocked.";

/// Phrases that mark a request as data modification rather than a question.
const BLOCKED_PHRASES: [&str; 6] = [
    "drop table",
    "truncate table",
    "delete from",
    "update table",
    "insert into",
    "alter table",
];

#[derive(Deserialize)]
struct IntentVerdict {
    intent: String,
}

pub struct UnderstandNode;

#[async_trait]
impl Node for UnderstandNode {
    async fn run(
        &self,
        state: &mut QueryState,
        ctx: &NodeContext,
    ) -> Result<Transition, NodeError> {
        state.node_started(
            "understand",
            vec![ThinkingStep::in_progress(
                "intent-1",
                "Classifying query intent",
            )],
        );

        let query = state.user_query.trim().to_string();
        if query.is_empty() {
            state.set_error(
                "understand",
                EMPTY_QUERY_MESSAGE,
                Some(json!({"category": "validation_error"})),
            );
            return Ok(Transition::Next(NodeKind::Error));
        }
        let lowered = query.to_lowercase();
        if BLOCKED_PHRASES.iter().any(|p| lowered.contains(p)) {
            state.set_error(
                "understand",
                BLOCKED_QUERY_MESSAGE,
                Some(json!({"category": "validation_error"})),
            );
            return Ok(Transition::Next(NodeKind::Error));
        }

        let system = "You classify analytics questions for a SQL assistant. \
                      Respond with JSON: {\"intent\": \"<short label such as \
                      read, aggregation, trend, comparison, lookup>\"}";
        let prompt = format!("Classify the intent of this question:\n{query}");
        let response = ctx
            .complete(state, system, vec![Message::user(&prompt)])
            .await?;

        let intent = match parse_json_response::<IntentVerdict>(&response.content) {
            Ok(verdict) => verdict.intent,
            // A free-text label is good enough; intent only steers prompts.
            Err(_) => response.content.trim().chars().take(60).collect(),
        };
        state.intent = intent;
        state.node_finished("understand", NodeStatus::Completed, None);
        Ok(Transition::Next(NodeKind::RetrieveContext))
    }
}
