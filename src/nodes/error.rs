//! Terminal error node: normalizes whatever failure brought the pipeline
//! here and ends the run. The engine emits the `error` lifecycle event.

use async_trait::async_trait;

use crate::node::{Node, NodeContext, NodeError, Terminal, Transition};
use crate::state::{NodeStatus, QueryState};

pub struct ErrorNode;

#[async_trait]
impl Node for ErrorNode {
    async fn run(
        &self,
        state: &mut QueryState,
        _ctx: &NodeContext,
    ) -> Result<Transition, NodeError> {
        if state.error.is_none() {
            state.error = Some("internal error".to_string());
            state.error_stage = Some(
                state
                    .error_stage
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            );
        }
        tracing::error!(
            query_id = %state.query_id,
            stage = state.error_stage.as_deref().unwrap_or("unknown"),
            error = state.error.as_deref().unwrap_or(""),
            "query terminated with error"
        );
        state.node_finished("error", NodeStatus::Completed, None);
        Ok(Transition::Terminal(Terminal::Failed))
    }
}
