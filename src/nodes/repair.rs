//! SQL repair: bounded rewrite after a recognizable execution error.
//!
//! Cheap pattern fixes run before the model is consulted: reserved-word
//! quoting for invalid identifiers, statement-terminator cleanup, and
//! schema-context expansion when a table was missing. Whatever path
//! produced a new statement loops back to validation.

use async_trait::async_trait;

use super::schema_context_text;
use crate::db::oracle::extract_ora_code;
use crate::llm::strip_code_fences;
use crate::message::Message;
use crate::node::{Node, NodeContext, NodeError, Transition};
use crate::sql::quote_reserved_identifiers;
use crate::state::{MAX_REPAIR_ATTEMPTS, NodeStatus, QueryState, ThinkingStep};
use crate::types::{DatabaseType, NodeKind};

pub struct RepairSqlNode;

impl RepairSqlNode {
    /// Pattern-based fixes that don't need the model. Returns the repaired
    /// SQL when one applied.
    fn pattern_repair(state: &QueryState, error_text: &str) -> Option<(String, &'static str)> {
        match extract_ora_code(error_text).as_deref() {
            Some("ORA-00904") => {
                let quoted = quote_reserved_identifiers(&state.sql_query, state.database_type);
                if quoted != state.sql_query {
                    return Some((quoted, "identifier_quote"));
                }
                // The offending identifier is not a reserved word; leave
                // the rewrite to the model.
                None
            }
            Some("ORA-00933") => {
                let trimmed = state.sql_query.trim().trim_end_matches(';').to_string();
                (trimmed != state.sql_query).then_some((trimmed, "command_termination"))
            }
            _ => None,
        }
    }
}

#[async_trait]
impl Node for RepairSqlNode {
    async fn run(
        &self,
        state: &mut QueryState,
        ctx: &NodeContext,
    ) -> Result<Transition, NodeError> {
        state.node_started(
            "repair_sql",
            vec![ThinkingStep::in_progress(
                "repair-1",
                "Analyzing SQL error and attempting repair",
            )],
        );

        if state.repair_attempts >= MAX_REPAIR_ATTEMPTS {
            return Err(NodeError::Internal(
                "repair budget exhausted before entering repair".to_string(),
            ));
        }

        let error_text = state.error.clone().unwrap_or_default();

        if let Some((repaired, repair_kind)) = Self::pattern_repair(state, &error_text) {
            state.sql_query = repaired;
            state.repair_attempts += 1;
            state.push_thinking_step(
                "repair_sql",
                ThinkingStep::completed(
                    "repair-pattern",
                    format!("Applied {repair_kind} auto-fix"),
                ),
            );
            state.node_finished("repair_sql", NodeStatus::Completed, None);
            return Ok(Transition::Next(NodeKind::Validate));
        }

        // A missing table often means the relevant part of the schema was
        // never in context: refresh it before asking for a rewrite.
        if extract_ora_code(&error_text).as_deref() == Some("ORA-00942") {
            if let Ok(schema) = ctx
                .services
                .database
                .get_schema(
                    state.database_type,
                    &state.user_query,
                    state.connection_name.as_deref(),
                )
                .await
            {
                state.context.schema_metadata = serde_json::to_value(&schema).ok();
                state.push_thinking_step(
                    "repair_sql",
                    ThinkingStep::completed("repair-schema", "Expanded schema context"),
                );
            }
        }

        let schema = schema_context_text(state, ctx);
        let request = state.active_request().to_string();
        let dialect_note = match state.database_type {
            DatabaseType::Oracle => "a valid Oracle 12c+ query; quote reserved words like DATE",
            DatabaseType::Doris => "a valid Doris query; backtick-quote reserved identifiers",
            DatabaseType::Postgres => "a valid PostgreSQL query",
        };
        let system = "Return only the final SQL without code fences.";
        let prompt = format!(
            "The previous SQL failed with this error:\n---\n{error_text}\n---\n\
             Original user request:\n{request}\n\n\
             Database schema (use only these tables/columns):\n{schema}\n\n\
             Repair the SQL into {dialect_note} that fulfills the user \
             request. If a table was not found, use the exact name from the \
             schema above. Return ONLY the SQL.",
        );

        let response = ctx
            .complete(state, system, vec![Message::user(&prompt)])
            .await?;
        let repaired = strip_code_fences(&response.content);
        state.sql_query = quote_reserved_identifiers(&repaired, state.database_type);
        state.repair_attempts += 1;
        state.push_thinking_step(
            "repair_sql",
            ThinkingStep::completed(
                "repair-llm",
                format!("SQL repaired using LLM (attempt {})", state.repair_attempts),
            ),
        );
        state.node_finished("repair_sql", NodeStatus::Completed, None);
        Ok(Transition::Next(NodeKind::Validate))
    }
}
