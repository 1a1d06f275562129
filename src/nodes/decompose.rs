//! Multi-part query decomposition.
//!
//! Detects questions that bundle several independent asks ("top customers,
//! then their recent orders") and plans them as sequential sub-queries.
//! This node only plans: it records the parts and points the cursor at the
//! first one, then enters SQL generation. Each sub-query runs through the
//! real generate_sql → validate → await_approval → execute gate (the
//! execute node advances the cursor), so every sub-query faces the same
//! review a single query does. Concatenated results go straight to
//! formatting, skipping further hypothesis loops.

use async_trait::async_trait;
use serde_json::json;

use crate::lifecycle::QueryPhase;
use crate::node::{Node, NodeContext, NodeError, Transition};
use crate::state::{NodeStatus, QueryState, SubQuery, ThinkingStep};
use crate::types::NodeKind;

/// Connectives that split a question into independent parts.
const PART_SEPARATORS: [&str; 4] = ["; also ", ". also ", "; then ", ". then "];

/// Minimum length for a fragment to count as a real sub-question.
const MIN_PART_LEN: usize = 12;

/// Split a multi-part question into its parts, or `None` for simple ones.
#[must_use]
pub fn detect_multi_part(user_query: &str) -> Option<Vec<String>> {
    let lowered = user_query.to_lowercase();
    for separator in PART_SEPARATORS {
        if let Some(idx) = lowered.find(separator) {
            let first = user_query[..idx].trim();
            let second = user_query[idx + separator.len()..].trim();
            if first.len() >= MIN_PART_LEN && second.len() >= MIN_PART_LEN {
                return Some(vec![first.to_string(), second.to_string()]);
            }
        }
    }
    None
}

pub struct DecomposeNode;

#[async_trait]
impl Node for DecomposeNode {
    async fn run(
        &self,
        state: &mut QueryState,
        ctx: &NodeContext,
    ) -> Result<Transition, NodeError> {
        state.node_started(
            "decompose",
            vec![ThinkingStep::in_progress(
                "decomp-1",
                "Checking if query needs decomposition",
            )],
        );

        let Some(parts) = detect_multi_part(&state.user_query) else {
            state.node_finished("decompose", NodeStatus::Completed, None);
            return Ok(Transition::Next(NodeKind::GenerateHypothesis));
        };

        ctx.emit(
            state,
            QueryPhase::Planning,
            json!({
                "decomposition": true,
                "sub_query_count": parts.len(),
                "parts": parts.clone(),
            }),
        )
        .await;

        state.sub_queries = parts
            .iter()
            .enumerate()
            .map(|(index, text)| SubQuery {
                index,
                text: text.clone(),
                sql: None,
            })
            .collect();
        state.active_sub_query = Some(0);
        state.combined_result = None;
        state.push_thinking_step(
            "decompose",
            ThinkingStep::completed(
                "decomp-plan",
                format!("Decomposed into {} sub-queries", parts.len()),
            ),
        );
        state.node_finished("decompose", NodeStatus::Completed, None);
        Ok(Transition::Next(NodeKind::GenerateSql))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn simple_queries_are_not_decomposed() {
        assert_eq!(detect_multi_part("Show top customers by revenue"), None);
        // Fragments below the length floor do not count.
        assert_eq!(detect_multi_part("a; then b"), None);
    }

    #[test]
    fn multi_part_queries_split() {
        let parts =
            detect_multi_part("Show top customers by revenue; then show their recent orders")
                .unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0], "Show top customers by revenue");
        assert_eq!(parts[1], "show their recent orders");
    }
}
