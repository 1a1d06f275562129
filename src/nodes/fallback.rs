//! Fallback SQL generation: a deliberately simpler variant once repair is
//! exhausted. Strict schema constraints, fewer joins, a tight row bound.

use async_trait::async_trait;
use serde_json::json;

use super::schema_context_text;
use crate::llm::strip_code_fences;
use crate::message::Message;
use crate::node::{Node, NodeContext, NodeError, Transition};
use crate::sql::quote_reserved_identifiers;
use crate::state::{MAX_FALLBACK_ATTEMPTS, NodeStatus, QueryState, ThinkingStep};
use crate::types::NodeKind;

pub struct GenerateFallbackSqlNode;

#[async_trait]
impl Node for GenerateFallbackSqlNode {
    async fn run(
        &self,
        state: &mut QueryState,
        ctx: &NodeContext,
    ) -> Result<Transition, NodeError> {
        state.node_started(
            "generate_fallback_sql",
            vec![ThinkingStep::in_progress(
                "fallback-1",
                "Generating simpler fallback SQL query",
            )],
        );

        // Cap overflow: straight to formatting when partial output exists,
        // otherwise terminal error. Reachable when the attempt counter was
        // bumped and the model call then failed into an engine retry.
        if state.fallback_attempts >= MAX_FALLBACK_ATTEMPTS {
            if state.execution_result.is_some() {
                state.push_thinking_step(
                    "generate_fallback_sql",
                    ThinkingStep::completed(
                        "fallback-cap",
                        "Fallback budget exhausted, keeping partial results",
                    ),
                );
                state.node_finished("generate_fallback_sql", NodeStatus::Completed, None);
                return Ok(Transition::Next(NodeKind::FormatResults));
            }
            state.set_error(
                "generate_fallback_sql",
                "fallback budget exhausted",
                Some(json!({"category": "db_error.non_recoverable"})),
            );
            return Ok(Transition::Next(NodeKind::Error));
        }
        state.fallback_attempts += 1;

        let schema = schema_context_text(state, ctx);
        let request = state.active_request().to_string();
        let system = "You are a SQL expert. Return only SQL without code \
                      fences or explanations.";
        let prompt = format!(
            "You are generating a SIMPLER fallback SQL query after a \
             previous attempt failed.\n\n\
             Schema constraints (column names are strict, use ONLY these):\n{schema}\n\n\
             Fallback strategy:\n\
             1. Simplify the query logic (fewer JOINs, simpler WHERE clauses)\n\
             2. Bound the result set to 100 rows\n\
             3. Prefer direct column references over complex expressions\n\n\
             Original user request: {request}\n\
             Original hypothesis: {hypothesis}\n\
             Previous error: {error}\n\n\
             Target database: {database}",
            hypothesis = state.hypothesis.chars().take(500).collect::<String>(),
            error = state
                .error
                .as_deref()
                .unwrap_or_default()
                .chars()
                .take(300)
                .collect::<String>(),
            database = state.database_type,
        );

        let response = ctx
            .complete(state, system, vec![Message::user(&prompt)])
            .await?;
        let sql = strip_code_fences(&response.content);
        state.sql_query = quote_reserved_identifiers(&sql, state.database_type);
        state.push_thinking_step(
            "generate_fallback_sql",
            ThinkingStep::completed(
                "fallback-done",
                format!("Fallback SQL generated (attempt {})", state.fallback_attempts),
            ),
        );
        state.node_finished("generate_fallback_sql", NodeStatus::Completed, None);
        Ok(Transition::Next(NodeKind::Validate))
    }
}
