//! Query execution against the routed backend.
//!
//! The cache is consulted first (normalized SQL + backend hash). On a
//! miss, execution goes through the database router (breaker, classified
//! retries, deadline) and successful results are cached with a `query_id`
//! reference for the large-result fetch path.
//!
//! For decomposed queries this node also advances the sub-query cursor:
//! each success folds its rows into the running concatenation and either
//! hands the next sub-query back to SQL generation (where validation and
//! the approval gate await it again) or, after the last one, routes the
//! combined result straight to formatting.
//!
//! Failure routing implements the repair/fallback ladder: recoverable
//! errors bubble up for engine-scheduled retries, non-recoverable ones
//! walk repair (≤ 2) then fallback (≤ 1) before giving up.

use async_trait::async_trait;
use serde_json::json;

use crate::db::DbErrorKind;
use crate::db::oracle::parse_oracle_error;
use crate::node::{Node, NodeContext, NodeError, Transition};
use crate::state::{
    ExecutionResult, MAX_FALLBACK_ATTEMPTS, MAX_REPAIR_ATTEMPTS, NodeStatus, QueryState,
    ThinkingStep,
};
use crate::types::{DatabaseType, NodeKind};

pub struct ExecuteNode;

impl ExecuteNode {
    /// Common success tail for fresh and cached results.
    ///
    /// Single-part queries proceed to result validation. For decomposed
    /// queries the result is concatenated and the cursor advanced; the
    /// next sub-query re-enters the pipeline unapproved so it faces its
    /// own review.
    async fn complete_success(
        &self,
        state: &mut QueryState,
        ctx: &NodeContext,
        result: ExecutionResult,
    ) -> Transition {
        state.error = None;
        state.error_stage = None;

        let Some(index) = state.active_sub_query else {
            state.execution_result = Some(result);
            state.node_finished("execute", NodeStatus::Completed, None);
            return Transition::Next(NodeKind::ValidateResults);
        };

        if let Some(sub) = state.sub_queries.get_mut(index) {
            sub.sql = Some(state.sql_query.clone());
        }
        // Sub-queries are independent; rows are stacked under the first
        // part's column set.
        let combined = match state.combined_result.take() {
            None => result,
            Some(mut acc) => {
                acc.rows.extend(result.rows);
                acc.row_count = acc.rows.len();
                acc.execution_time_ms += result.execution_time_ms;
                acc
            }
        };

        if index + 1 < state.sub_queries.len() {
            state.combined_result = Some(combined);
            state.active_sub_query = Some(index + 1);
            // Approval covered this sub-query's SQL only.
            state.approved = false;
            state.needs_approval = false;
            state.push_thinking_step(
                "execute",
                ThinkingStep::completed(
                    "exec-subquery",
                    format!("Sub-query {} executed, {} remaining", index + 1,
                        state.sub_queries.len() - index - 1),
                ),
            );
            state.node_finished("execute", NodeStatus::Completed, None);
            return Transition::Next(NodeKind::GenerateSql);
        }

        // Last sub-query: cache the concatenation under this query's id so
        // the reference fetch path covers multi-part results too.
        state.active_sub_query = None;
        let joined_sql: Vec<String> = state
            .sub_queries
            .iter()
            .filter_map(|sub| sub.sql.clone())
            .collect();
        let cache_sql = joined_sql.join("; ");
        ctx.services
            .results
            .store(&state.query_id, &cache_sql, state.database_type, &combined)
            .await;
        state.sql_query = cache_sql;
        state.execution_result = Some(combined);
        state.node_finished("execute", NodeStatus::Completed, None);
        Transition::Next(NodeKind::FormatResults)
    }
}

#[async_trait]
impl Node for ExecuteNode {
    async fn run(
        &self,
        state: &mut QueryState,
        ctx: &NodeContext,
    ) -> Result<Transition, NodeError> {
        state.node_started(
            "execute",
            vec![ThinkingStep::in_progress("exec-1", "Executing SQL query")],
        );

        if let Some(cached) = ctx
            .services
            .results
            .fetch_by_sql(&state.sql_query, state.database_type)
            .await
        {
            tracing::info!(query_id = %state.query_id, "result cache hit");
            // Register this query_id against the cached entry so the
            // reference fetch path works for the new query too.
            ctx.services
                .results
                .store(&state.query_id, &state.sql_query, state.database_type, &cached)
                .await;
            state.push_thinking_step(
                "execute",
                ThinkingStep::completed("exec-cache", "Served from result cache"),
            );
            return Ok(self.complete_success(state, ctx, cached).await);
        }

        let outcome = ctx
            .services
            .database
            .execute_sql(
                state.database_type,
                &state.sql_query,
                state.connection_name.as_deref(),
                Some(&state.user_id),
            )
            .await;

        match outcome {
            Ok(result) => {
                ctx.services
                    .results
                    .store(&state.query_id, &state.sql_query, state.database_type, &result)
                    .await;
                Ok(self.complete_success(state, ctx, result).await)
            }
            Err(err) => {
                let recoverable = matches!(
                    err.kind,
                    DbErrorKind::Connection | DbErrorKind::Timeout | DbErrorKind::Transient
                );
                if recoverable || err.kind == DbErrorKind::CircuitOpen {
                    // Engine retry policy handles the recoverable class;
                    // an open breaker is terminal for this attempt.
                    return Err(NodeError::Db(err));
                }

                let oracle_detail = (state.database_type == DatabaseType::Oracle)
                    .then(|| parse_oracle_error(&err.message))
                    .filter(|info| info.error_code.is_some());
                let repairable = matches!(
                    err.kind,
                    DbErrorKind::Syntax
                        | DbErrorKind::MissingObject
                        | DbErrorKind::InvalidIdentifier
                        | DbErrorKind::Other
                );

                if repairable && state.repair_attempts < MAX_REPAIR_ATTEMPTS {
                    state.error = Some(err.message.clone());
                    state.error_stage = Some("execute".to_string());
                    state.node_finished("execute", NodeStatus::Failed, Some(err.message));
                    return Ok(Transition::Next(NodeKind::RepairSql));
                }
                if repairable && state.fallback_attempts < MAX_FALLBACK_ATTEMPTS {
                    state.error = Some(err.message.clone());
                    state.error_stage = Some("execute".to_string());
                    state.node_finished("execute", NodeStatus::Failed, Some(err.message));
                    return Ok(Transition::Next(NodeKind::GenerateFallbackSql));
                }

                // Loop budget exhausted: keep partial output when we have
                // it, otherwise terminate with the classified error.
                if state.execution_result.is_some() {
                    state.node_finished("execute", NodeStatus::Failed, Some(err.message));
                    return Ok(Transition::Next(NodeKind::FormatResults));
                }
                state.set_error(
                    "execute",
                    err.message.clone(),
                    Some(json!({
                        "category": "db_error.non_recoverable",
                        "kind": err.kind,
                        "oracle": oracle_detail,
                    })),
                );
                Ok(Transition::Next(NodeKind::Error))
            }
        }
    }
}
