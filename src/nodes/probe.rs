//! Structural SQL probe: a zero-row dry-run before real execution.
//!
//! Oracle only; eligibility is decided by the token scan in
//! [`crate::sql::probe_eligible`] before this node is ever routed to.
//! A failed probe hands the error to the repair loop instead of burning a
//! real execution attempt.

use async_trait::async_trait;
use serde_json::json;

use crate::node::{Node, NodeContext, NodeError, Transition};
use crate::state::{MAX_REPAIR_ATTEMPTS, NodeStatus, QueryState, ThinkingStep};
use crate::types::NodeKind;

pub struct ProbeSqlNode;

#[async_trait]
impl Node for ProbeSqlNode {
    async fn run(
        &self,
        state: &mut QueryState,
        ctx: &NodeContext,
    ) -> Result<Transition, NodeError> {
        state.node_started(
            "probe_sql",
            vec![ThinkingStep::in_progress(
                "probe-1",
                "Dry-running query structure",
            )],
        );

        match ctx
            .services
            .database
            .probe_sql(
                state.database_type,
                &state.sql_query,
                state.connection_name.as_deref(),
            )
            .await
        {
            Ok(()) => {
                state.node_finished("probe_sql", NodeStatus::Completed, None);
                Ok(Transition::Next(NodeKind::Execute))
            }
            Err(err) if state.repair_attempts < MAX_REPAIR_ATTEMPTS => {
                tracing::info!(
                    query_id = %state.query_id,
                    error = %err,
                    "probe failed; routing to repair"
                );
                state.error = Some(err.message.clone());
                state.error_stage = Some("probe_sql".to_string());
                state.node_finished("probe_sql", NodeStatus::Failed, Some(err.message));
                Ok(Transition::Next(NodeKind::RepairSql))
            }
            Err(err) => {
                state.set_error(
                    "probe_sql",
                    err.message.clone(),
                    Some(json!({"category": "db_error.non_recoverable"})),
                );
                Ok(Transition::Next(NodeKind::Error))
            }
        }
    }
}
