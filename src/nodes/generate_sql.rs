//! SQL generation from hypothesis + context.
//!
//! The model answers with a JSON envelope carrying the SQL, a confidence
//! score, and an optional clarification request. Low-confidence answers
//! with a clarification message suspend the pipeline until the user
//! supplies details through the clarify endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use super::schema_context_text;
use crate::lifecycle::QueryPhase;
use crate::llm::{parse_json_response, strip_code_fences};
use crate::message::Message;
use crate::node::{Node, NodeContext, NodeError, SuspendReason, Transition};
use crate::sql::quote_reserved_identifiers;
use crate::state::{NodeStatus, QueryState, ThinkingStep};
use crate::types::NodeKind;

/// Confidence floor below which a clarification request is honored.
const CLARIFICATION_CONFIDENCE_FLOOR: u8 = 40;

#[derive(Deserialize)]
struct SqlEnvelope {
    sql: String,
    #[serde(default)]
    confidence: Option<u8>,
    #[serde(default)]
    clarification_needed: bool,
    #[serde(default)]
    clarification_message: Option<String>,
}

pub struct GenerateSqlNode;

#[async_trait]
impl Node for GenerateSqlNode {
    async fn run(
        &self,
        state: &mut QueryState,
        ctx: &NodeContext,
    ) -> Result<Transition, NodeError> {
        state.node_started(
            "generate_sql",
            vec![ThinkingStep::in_progress("sql-1", "Generating SQL query")],
        );

        let schema = schema_context_text(state, ctx);
        // For a decomposed query this targets the active sub-question.
        let request = state.active_request().to_string();
        let clarifications = state
            .clarification_history
            .iter()
            .map(|c| format!("- {}", c.clarification))
            .collect::<Vec<_>>()
            .join("\n");
        let clarification_note = if clarifications.is_empty() {
            String::new()
        } else {
            format!("\nUser clarifications so far:\n{clarifications}\n")
        };
        let examples_note = if state.context.semantic_hits.is_empty() {
            String::new()
        } else {
            format!(
                "\nSimilar answered questions:\n{}\n",
                state.context.semantic_hits.join("\n")
            )
        };

        let system = "You write production SQL. Respond with JSON only: \
                      {\"sql\": \"...\", \"confidence\": 0-100, \
                      \"clarification_needed\": bool, \
                      \"clarification_message\": \"...\"}. \
                      The SQL must be a single read-only statement.";
        let prompt = format!(
            "Question: {request}\nPlan:\n{hypothesis}\nDatabase: {database}\n\
             Schema (use only these tables/columns):\n{schema}\n{clarification_note}{examples_note}\
             Rules:\n\
             - Quote reserved words used as identifiers.\n\
             - Bound the result set (FETCH FIRST / LIMIT) unless aggregation makes it small.\n\
             - If the question is too ambiguous to answer, set clarification_needed.",
            hypothesis = state.hypothesis,
            database = state.database_type,
        );

        let response = ctx
            .complete(state, system, vec![Message::user(&prompt)])
            .await?;

        let envelope = match parse_json_response::<SqlEnvelope>(&response.content) {
            Ok(envelope) => envelope,
            Err(parse_err) => {
                // Some models ignore the envelope and answer with bare SQL.
                let raw = strip_code_fences(&response.content);
                let head = raw.trim_start().to_uppercase();
                if head.starts_with("SELECT") || head.starts_with("WITH") {
                    SqlEnvelope {
                        sql: raw,
                        confidence: Some(50),
                        clarification_needed: false,
                        clarification_message: None,
                    }
                } else {
                    return Err(parse_err.into());
                }
            }
        };

        let confidence = envelope.confidence.unwrap_or(50).min(100);
        if envelope.clarification_needed && confidence < CLARIFICATION_CONFIDENCE_FLOOR {
            if let Some(message) = envelope
                .clarification_message
                .filter(|m| !m.trim().is_empty())
            {
                state.clarification_message = Some(message.clone());
                ctx.emit(
                    state,
                    QueryPhase::GeneratingSql,
                    json!({
                        "clarification_required": true,
                        "message": message,
                    }),
                )
                .await;
                state.node_finished("generate_sql", NodeStatus::Completed, None);
                return Ok(Transition::Suspend(SuspendReason::PendingClarification));
            }
        }

        let sql = quote_reserved_identifiers(
            strip_code_fences(&envelope.sql).as_str(),
            state.database_type,
        );
        state.sql_query = sql;
        state.sql_confidence = confidence;
        state.clarification_message = None;
        state.node_finished("generate_sql", NodeStatus::Completed, None);
        Ok(Transition::Next(NodeKind::Validate))
    }
}
