//! Terminal formatting: visualization hints and data-quality attachment.

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::node::{Node, NodeContext, NodeError, Terminal, Transition};
use crate::state::{
    ExecutionResult, NodeStatus, QueryState, ThinkingStep, VisualizationHints,
};

/// Heuristic chart-type choice from result shape.
#[must_use]
pub fn visualization_for(result: &ExecutionResult) -> VisualizationHints {
    let numeric_second_column = result.rows.iter().all(|row| {
        row.get(1)
            .map(Value::is_number)
            .unwrap_or(false)
    });

    if result.rows.len() == 1 && result.columns.len() == 1 {
        return VisualizationHints {
            chart_type: "number".to_string(),
            x_axis: None,
            y_axis: result.columns.first().cloned(),
            reason: Some("single scalar value".to_string()),
        };
    }
    if result.columns.len() == 2 && !result.rows.is_empty() && numeric_second_column {
        let first = result.columns[0].to_lowercase();
        let time_like = ["date", "month", "year", "day", "time", "quarter"]
            .iter()
            .any(|marker| first.contains(marker));
        return VisualizationHints {
            chart_type: if time_like { "line" } else { "bar" }.to_string(),
            x_axis: result.columns.first().cloned(),
            y_axis: result.columns.get(1).cloned(),
            reason: Some("categorical label with one numeric measure".to_string()),
        };
    }
    VisualizationHints {
        chart_type: "table".to_string(),
        x_axis: None,
        y_axis: None,
        reason: None,
    }
}

pub struct FormatResultsNode;

#[async_trait]
impl Node for FormatResultsNode {
    async fn run(
        &self,
        state: &mut QueryState,
        _ctx: &NodeContext,
    ) -> Result<Transition, NodeError> {
        state.node_started(
            "format_results",
            vec![ThinkingStep::in_progress(
                "fmt-1",
                "Formatting results and visualization hints",
            )],
        );

        let Some(result) = state.execution_result.as_mut() else {
            // Only reachable through a cap-overflow path that had nothing
            // to show; terminate as a failure instead of a hollow success.
            state.set_error(
                "format_results",
                state
                    .error
                    .clone()
                    .unwrap_or_else(|| "no execution result to format".to_string()),
                Some(json!({"category": "internal_error"})),
            );
            return Ok(Transition::Terminal(Terminal::Failed));
        };

        if let Some(analysis) = &state.result_analysis {
            result.data_quality = serde_json::to_value(analysis).ok();
        }
        state.visualization_hints = Some(visualization_for(result));
        state.node_finished("format_results", NodeStatus::Completed, None);
        Ok(Transition::Terminal(Terminal::Finished))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn scalar_result_hints_number() {
        let result = ExecutionResult::new(vec!["total".into()], vec![vec![json!(42)]], 1);
        assert_eq!(visualization_for(&result).chart_type, "number");
    }

    #[test]
    fn label_plus_measure_hints_bar() {
        let result = ExecutionResult::new(
            vec!["region".into(), "revenue".into()],
            vec![vec![json!("EMEA"), json!(10)], vec![json!("APAC"), json!(20)]],
            1,
        );
        assert_eq!(visualization_for(&result).chart_type, "bar");
    }

    #[test]
    fn time_series_hints_line() {
        let result = ExecutionResult::new(
            vec!["month".into(), "revenue".into()],
            vec![vec![json!("JAN"), json!(10)]],
            1,
        );
        assert_eq!(visualization_for(&result).chart_type, "line");
    }

    #[test]
    fn wide_results_hint_table() {
        let result = ExecutionResult::new(
            vec!["a".into(), "b".into(), "c".into()],
            vec![vec![json!(1), json!(2), json!(3)]],
            1,
        );
        assert_eq!(visualization_for(&result).chart_type, "table");
    }
}
