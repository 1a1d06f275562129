//! Hypothesis generation: a free-form execution plan for the query,
//! refreshed with the latest pivot strategy when the pipeline loops back.

use async_trait::async_trait;

use super::schema_context_text;
use crate::message::Message;
use crate::node::{Node, NodeContext, NodeError, Transition};
use crate::state::{NodeStatus, QueryState, ThinkingStep};
use crate::types::NodeKind;

pub struct GenerateHypothesisNode;

#[async_trait]
impl Node for GenerateHypothesisNode {
    async fn run(
        &self,
        state: &mut QueryState,
        ctx: &NodeContext,
    ) -> Result<Transition, NodeError> {
        state.node_started(
            "generate_hypothesis",
            vec![ThinkingStep::in_progress(
                "hyp-1",
                "Drafting a query execution plan",
            )],
        );

        let schema = schema_context_text(state, ctx);
        let pivot_note = state
            .pivot_strategies
            .last()
            .map(|strategy| format!("\nA previous attempt failed. Apply this alternative strategy:\n{strategy}\n"))
            .unwrap_or_default();
        let system = "You plan SQL queries. Describe, in a few short steps, \
                      which tables to use, how to join and filter them, and \
                      what to aggregate. Plain text, no SQL yet.";
        let prompt = format!(
            "Question: {query}\nIntent: {intent}\nDatabase: {database}\n\
             Available schema:\n{schema}\n{pivot_note}",
            query = state.user_query,
            intent = state.intent,
            database = state.database_type,
        );

        let response = ctx
            .complete(state, system, vec![Message::user(&prompt)])
            .await?;
        let hypothesis = response.content.trim().to_string();
        state.messages.push(Message::assistant(&hypothesis));
        state.hypothesis = hypothesis;
        state.node_finished("generate_hypothesis", NodeStatus::Completed, None);
        Ok(Transition::Next(NodeKind::GenerateSql))
    }
}
