//! Context retrieval: schema metadata plus semantic example hits.
//!
//! Retrieval is non-fatal by contract. A backend or knowledge-graph outage
//! leaves the context empty and the pipeline continues; SQL generation
//! simply works with less grounding.

use async_trait::async_trait;

use crate::node::{Node, NodeContext, NodeError, Transition};
use crate::state::{NodeStatus, QueryState, ThinkingStep};
use crate::types::NodeKind;

pub struct RetrieveContextNode;

#[async_trait]
impl Node for RetrieveContextNode {
    async fn run(
        &self,
        state: &mut QueryState,
        ctx: &NodeContext,
    ) -> Result<Transition, NodeError> {
        state.node_started(
            "retrieve_context",
            vec![ThinkingStep::in_progress(
                "ctx-1",
                "Retrieving schema metadata and examples",
            )],
        );

        match ctx
            .services
            .database
            .get_schema(
                state.database_type,
                &state.user_query,
                state.connection_name.as_deref(),
            )
            .await
        {
            Ok(schema) => {
                state.context.schema_metadata = serde_json::to_value(&schema).ok();
            }
            Err(err) => {
                tracing::warn!(
                    query_id = %state.query_id,
                    error = %err,
                    "schema retrieval failed; continuing with empty context"
                );
            }
        }

        // Curated semantic examples, when an ingestion job has published
        // them for this backend. Missing key or degraded KV both mean none.
        let examples_key = format!("semantic_examples:{}", state.database_type);
        match ctx.services.kv.get(&examples_key).await {
            Ok(Some(raw)) => {
                if let Ok(hits) = serde_json::from_str::<Vec<String>>(&raw) {
                    state.context.semantic_hits = hits;
                    state.context.graphiti_available = true;
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::debug!(error = %err, "semantic example lookup degraded");
            }
        }

        state.node_finished("retrieve_context", NodeStatus::Completed, None);
        Ok(Transition::Next(NodeKind::Decompose))
    }
}
