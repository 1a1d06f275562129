//! Post-execution result analysis.
//!
//! Scores the result set and flags issues (empty results, all-null
//! columns). A poor score triggers the strategy pivot while the pivot
//! budget lasts; analysis problems themselves are never fatal.

use async_trait::async_trait;

use crate::node::{Node, NodeContext, NodeError, Transition};
use crate::state::{
    ExecutionResult, MAX_PIVOT_ATTEMPTS, NodeStatus, QueryState, ResultAnalysis, ThinkingStep,
};
use crate::types::NodeKind;

/// Scores below this are worth a pivot.
const QUALITY_FLOOR: u8 = 50;

/// Analyze a result set: score 0–100 plus concrete issues.
#[must_use]
pub fn analyze_result(result: &ExecutionResult) -> ResultAnalysis {
    let mut issues = Vec::new();
    let mut score: i32 = 100;

    if result.rows.is_empty() {
        issues.push("query returned no rows".to_string());
        score = 20;
    } else {
        for (idx, column) in result.columns.iter().enumerate() {
            let all_null = result
                .rows
                .iter()
                .all(|row| row.get(idx).is_none_or(serde_json::Value::is_null));
            if all_null {
                issues.push(format!("column {column} is entirely null"));
                score -= 25;
            }
        }
        if result.columns.is_empty() {
            issues.push("result has no columns".to_string());
            score = 30;
        }
    }

    let score = score.clamp(0, 100) as u8;
    ResultAnalysis {
        quality_score: score,
        acceptable: score >= QUALITY_FLOOR,
        issues,
    }
}

pub struct ValidateResultsNode;

#[async_trait]
impl Node for ValidateResultsNode {
    async fn run(
        &self,
        state: &mut QueryState,
        _ctx: &NodeContext,
    ) -> Result<Transition, NodeError> {
        state.node_started(
            "validate_results",
            vec![ThinkingStep::in_progress(
                "resval-1",
                "Analyzing result quality",
            )],
        );

        let Some(result) = state.execution_result.as_ref() else {
            // Nothing to analyze; let formatting handle the gap.
            state.node_finished("validate_results", NodeStatus::Completed, None);
            return Ok(Transition::Next(NodeKind::FormatResults));
        };

        let analysis = analyze_result(result);
        let pivot_worthwhile =
            !analysis.acceptable && state.pivot_attempts < MAX_PIVOT_ATTEMPTS;
        state.result_analysis = Some(analysis);
        state.node_finished("validate_results", NodeStatus::Completed, None);

        if pivot_worthwhile {
            Ok(Transition::Next(NodeKind::PivotStrategy))
        } else {
            Ok(Transition::Next(NodeKind::FormatResults))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn healthy_result_scores_high() {
        let result = ExecutionResult::new(
            vec!["id".into()],
            vec![vec![json!(1)], vec![json!(2)]],
            5,
        );
        let analysis = analyze_result(&result);
        assert_eq!(analysis.quality_score, 100);
        assert!(analysis.acceptable);
    }

    #[test]
    fn empty_result_scores_low() {
        let result = ExecutionResult::new(vec!["id".into()], vec![], 5);
        let analysis = analyze_result(&result);
        assert_eq!(analysis.quality_score, 20);
        assert!(!analysis.acceptable);
    }

    #[test]
    fn all_null_columns_are_flagged() {
        let result = ExecutionResult::new(
            vec!["a".into(), "b".into()],
            vec![
                vec![json!(1), json!(null)],
                vec![json!(2), json!(null)],
            ],
            5,
        );
        let analysis = analyze_result(&result);
        assert!(analysis.issues.iter().any(|i| i.contains("b")));
        assert_eq!(analysis.quality_score, 75);
    }
}
