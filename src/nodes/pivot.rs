//! Strategy pivoting: bounded re-planning after poor results.
//!
//! Asks the model for an alternative approach and loops back to
//! hypothesis generation. Capped at two pivots; at the cap (or on any
//! pivot failure) the pipeline proceeds to formatting with what it has.

use async_trait::async_trait;

use crate::message::Message;
use crate::node::{Node, NodeContext, NodeError, Transition};
use crate::state::{MAX_PIVOT_ATTEMPTS, NodeStatus, QueryState, ThinkingStep};
use crate::types::NodeKind;

pub struct PivotStrategyNode;

#[async_trait]
impl Node for PivotStrategyNode {
    async fn run(
        &self,
        state: &mut QueryState,
        ctx: &NodeContext,
    ) -> Result<Transition, NodeError> {
        state.node_started(
            "pivot_strategy",
            vec![ThinkingStep::in_progress(
                "pivot-1",
                "Generating alternative query strategy",
            )],
        );

        if state.pivot_attempts >= MAX_PIVOT_ATTEMPTS {
            tracing::warn!(
                query_id = %state.query_id,
                "max pivot attempts reached, proceeding to format results"
            );
            state.push_thinking_step(
                "pivot_strategy",
                ThinkingStep::completed(
                    "pivot-cap",
                    "Max pivot attempts reached, proceeding with current results",
                ),
            );
            state.node_finished("pivot_strategy", NodeStatus::Completed, None);
            return Ok(Transition::Next(NodeKind::FormatResults));
        }
        state.pivot_attempts += 1;

        let issues = state
            .result_analysis
            .as_ref()
            .map(|a| a.issues.join("; "))
            .unwrap_or_default();
        let system = "You are a SQL troubleshooting expert. Suggest a \
                      concretely different query strategy: other tables, \
                      broader filters, a different aggregation level, or a \
                      different join path. A short plan in plain text.";
        let prompt = format!(
            "Original question: {query}\nPrevious plan:\n{hypothesis}\n\
             Generated SQL:\n{sql}\nProblems with the result: {issues}",
            query = state.user_query,
            hypothesis = state.hypothesis,
            sql = state.sql_query.chars().take(500).collect::<String>(),
        );

        match ctx
            .complete(state, system, vec![Message::user(&prompt)])
            .await
        {
            Ok(response) => {
                let strategy = response.content.trim().to_string();
                state
                    .messages
                    .push(Message::assistant(&format!(
                        "Alternative strategy (attempt {}):\n{strategy}",
                        state.pivot_attempts
                    )));
                state.pivot_strategies.push(strategy);
                state.node_finished("pivot_strategy", NodeStatus::Completed, None);
                Ok(Transition::Next(NodeKind::GenerateHypothesis))
            }
            Err(err) => {
                // Pivoting is best-effort; keep the results we have.
                tracing::warn!(query_id = %state.query_id, error = %err, "pivot failed");
                state.node_finished("pivot_strategy", NodeStatus::Completed, None);
                Ok(Transition::Next(NodeKind::FormatResults))
            }
        }
    }
}
