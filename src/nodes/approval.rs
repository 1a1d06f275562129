//! HITL approval gate node.
//!
//! First entry with `needs_approval` set publishes `pending_approval` and
//! suspends; the engine checkpoints and the task ends. The approve
//! endpoint mutates the checkpointed state and resumes the thread, which
//! re-enters this node to route on the decision. A query already approved
//! earlier in the thread (repair loop re-validation) passes straight
//! through without re-emitting approval events.

use async_trait::async_trait;
use serde_json::json;

use crate::lifecycle::QueryPhase;
use crate::node::{Node, NodeContext, NodeError, SuspendReason, Terminal, Transition};
use crate::sql::probe_eligible;
use crate::state::{NodeStatus, QueryState, ThinkingStep};
use crate::types::NodeKind;

pub struct AwaitApprovalNode;

#[async_trait]
impl Node for AwaitApprovalNode {
    async fn run(
        &self,
        state: &mut QueryState,
        ctx: &NodeContext,
    ) -> Result<Transition, NodeError> {
        state.node_started(
            "await_approval",
            vec![ThinkingStep::in_progress(
                "approval-1",
                "Checking approval status",
            )],
        );

        if let Some(reason) = state.rejection_reason.clone() {
            state.push_thinking_step(
                "await_approval",
                ThinkingStep::completed("approval-rejected", format!("User rejected: {reason}")),
            );
            state.node_finished("await_approval", NodeStatus::Completed, None);
            return Ok(Transition::Terminal(Terminal::Rejected));
        }

        if state.approved {
            let next = if probe_eligible(&state.sql_query, state.database_type) {
                NodeKind::ProbeSql
            } else {
                NodeKind::Execute
            };
            if state.needs_approval {
                // First pass after the decision: acknowledge it once.
                state.needs_approval = false;
                ctx.emit(
                    state,
                    QueryPhase::Approved,
                    json!({
                        "sql": state.sql_query,
                        "message": "Query approved, executing...",
                    }),
                )
                .await;
            }
            state.node_finished("await_approval", NodeStatus::Completed, None);
            return Ok(Transition::Next(next));
        }

        if state.needs_approval {
            ctx.emit(
                state,
                QueryPhase::PendingApproval,
                json!({
                    "sql": state.sql_query,
                    "validation": state.validation_result,
                    "message": "Awaiting user approval",
                }),
            )
            .await;
            return Ok(Transition::Suspend(SuspendReason::PendingApproval));
        }

        // Approval not required by policy: fall through to execution.
        let next = if probe_eligible(&state.sql_query, state.database_type) {
            NodeKind::ProbeSql
        } else {
            NodeKind::Execute
        };
        state.node_finished("await_approval", NodeStatus::Completed, None);
        Ok(Transition::Next(next))
    }
}
