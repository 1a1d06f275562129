//! Node implementations for the query pipeline.
//!
//! Each node is a small stateless struct; the engine instantiates the full
//! set once via [`default_nodes`]. Shared helpers for schema-context
//! rendering live here.

use rustc_hash::FxHashMap;
use std::sync::Arc;

use crate::node::{Node, NodeContext};
use crate::state::QueryState;
use crate::types::NodeKind;

pub mod approval;
pub mod decompose;
pub mod error;
pub mod execute;
pub mod fallback;
pub mod format_results;
pub mod generate_sql;
pub mod hypothesis;
pub mod pivot;
pub mod probe;
pub mod repair;
pub mod retrieve_context;
pub mod understand;
pub mod validate;
pub mod validate_results;

/// The full node set, keyed for the engine's dispatch map.
#[must_use]
pub fn default_nodes() -> FxHashMap<NodeKind, Arc<dyn Node>> {
    let mut nodes: FxHashMap<NodeKind, Arc<dyn Node>> = FxHashMap::default();
    nodes.insert(NodeKind::Understand, Arc::new(understand::UnderstandNode));
    nodes.insert(
        NodeKind::RetrieveContext,
        Arc::new(retrieve_context::RetrieveContextNode),
    );
    nodes.insert(NodeKind::Decompose, Arc::new(decompose::DecomposeNode));
    nodes.insert(
        NodeKind::GenerateHypothesis,
        Arc::new(hypothesis::GenerateHypothesisNode),
    );
    nodes.insert(
        NodeKind::GenerateSql,
        Arc::new(generate_sql::GenerateSqlNode),
    );
    nodes.insert(NodeKind::Validate, Arc::new(validate::ValidateNode));
    nodes.insert(NodeKind::ProbeSql, Arc::new(probe::ProbeSqlNode));
    nodes.insert(
        NodeKind::AwaitApproval,
        Arc::new(approval::AwaitApprovalNode),
    );
    nodes.insert(NodeKind::Execute, Arc::new(execute::ExecuteNode));
    nodes.insert(
        NodeKind::ValidateResults,
        Arc::new(validate_results::ValidateResultsNode),
    );
    nodes.insert(NodeKind::PivotStrategy, Arc::new(pivot::PivotStrategyNode));
    nodes.insert(NodeKind::RepairSql, Arc::new(repair::RepairSqlNode));
    nodes.insert(
        NodeKind::GenerateFallbackSql,
        Arc::new(fallback::GenerateFallbackSqlNode),
    );
    nodes.insert(
        NodeKind::FormatResults,
        Arc::new(format_results::FormatResultsNode),
    );
    nodes.insert(NodeKind::Error, Arc::new(error::ErrorNode));
    nodes
}

/// Render the retrieved schema context as prompt text, bounded by the
/// provider's token budget.
#[must_use]
pub fn schema_context_text(state: &QueryState, ctx: &NodeContext) -> String {
    let rendered = state
        .context
        .schema_metadata
        .as_ref()
        .map(|schema| serde_json::to_string_pretty(schema).unwrap_or_default())
        .unwrap_or_default();
    crate::llm::truncate_to_token_budget(&rendered, ctx.context_budget())
}
