//! Pre-execution validation of generated SQL.
//!
//! Structural checks only (read-only statement, single statement, no
//! destructive verbs) plus a coarse risk classification. Every valid query
//! then routes to the approval gate; invalid SQL is a validation error.

use async_trait::async_trait;
use serde_json::json;

use crate::node::{Node, NodeContext, NodeError, Transition};
use crate::sql::{TokenKind, strip_comments, tokenize};
use crate::state::{
    CostEstimate, NodeStatus, QueryState, RiskLevel, ThinkingStep, ValidationReport,
};
use crate::types::NodeKind;

/// Verbs that disqualify a statement outright.
const DESTRUCTIVE_VERBS: [&str; 9] = [
    "INSERT", "UPDATE", "DELETE", "DROP", "TRUNCATE", "ALTER", "GRANT", "REVOKE", "MERGE",
];

/// Words that bound a result set.
const LIMIT_MARKERS: [&str; 3] = ["FETCH", "LIMIT", "ROWNUM"];

/// Structural checks shared with the decompose sub-query path.
/// Returns the first problem found.
pub fn basic_sql_checks(sql: &str) -> Result<(), String> {
    let stripped = strip_comments(sql);
    let trimmed = stripped.trim().trim_end_matches(';').trim();
    if trimmed.is_empty() {
        return Err("generated SQL is empty".to_string());
    }
    if trimmed.contains(';') {
        return Err("multiple statements are not allowed".to_string());
    }
    let tokens = tokenize(trimmed);
    let words: Vec<String> = tokens
        .iter()
        .filter(|t| t.kind == TokenKind::Word)
        .map(|t| trimmed[t.start..t.end].to_ascii_uppercase())
        .collect();
    match words.first().map(String::as_str) {
        Some("SELECT" | "WITH") => {}
        Some(other) => return Err(format!("only SELECT statements are allowed, got {other}")),
        None => return Err("generated SQL is empty".to_string()),
    }
    for word in &words {
        if DESTRUCTIVE_VERBS.contains(&word.as_str()) {
            return Err(format!("destructive keyword {word} is not allowed"));
        }
    }
    Ok(())
}

fn count_word(sql: &str, word: &str) -> u32 {
    let stripped = strip_comments(sql);
    let tokens = tokenize(&stripped);
    tokens
        .iter()
        .filter(|t| {
            t.kind == TokenKind::Word && stripped[t.start..t.end].eq_ignore_ascii_case(word)
        })
        .count() as u32
}

/// Whether the statement carries any row bound.
fn has_row_limit(sql: &str) -> bool {
    let stripped = strip_comments(sql);
    let tokens = tokenize(&stripped);
    tokens
        .iter()
        .filter(|t| t.kind == TokenKind::Word)
        .any(|t| LIMIT_MARKERS.contains(&stripped[t.start..t.end].to_ascii_uppercase().as_str()))
}

pub struct ValidateNode;

#[async_trait]
impl Node for ValidateNode {
    async fn run(
        &self,
        state: &mut QueryState,
        ctx: &NodeContext,
    ) -> Result<Transition, NodeError> {
        state.node_started(
            "validate",
            vec![ThinkingStep::in_progress(
                "val-1",
                "Validating generated SQL",
            )],
        );

        if let Err(problem) = basic_sql_checks(&state.sql_query) {
            state.validation_result = Some(ValidationReport {
                is_valid: false,
                risk_level: RiskLevel::High,
                requires_approval: true,
                warnings: vec![problem.clone()],
            });
            state.set_error(
                "validate",
                problem,
                Some(json!({"category": "validation_error"})),
            );
            return Ok(Transition::Next(NodeKind::Error));
        }

        let mut warnings = Vec::new();
        let risk_level = if has_row_limit(&state.sql_query) {
            RiskLevel::Low
        } else {
            warnings.push("query has no row limit; large scans possible".to_string());
            RiskLevel::Medium
        };

        // Coarse cost signal until a backend EXPLAIN is wired in: join
        // count and missing row bounds drive the level.
        let join_count = count_word(&state.sql_query, "JOIN");
        let cost_level = match (join_count, risk_level) {
            (0 | 1, RiskLevel::Low) => "low",
            (_, RiskLevel::High) => "high",
            (n, _) if n >= 3 => "high",
            _ => "medium",
        };
        state.cost_estimate = Some(CostEstimate {
            total_cost: f64::from(join_count + 1),
            cardinality: 0,
            cost_level: cost_level.to_string(),
            warnings: warnings.clone(),
            recommendations: if risk_level == RiskLevel::Low {
                Vec::new()
            } else {
                vec!["add a row bound (FETCH FIRST / LIMIT)".to_string()]
            },
        });

        let requires_approval =
            ctx.services.settings.require_approval_for_all || risk_level != RiskLevel::Low;
        state.validation_result = Some(ValidationReport {
            is_valid: true,
            risk_level,
            requires_approval,
            warnings,
        });
        // A query approved earlier in this thread (repair loop) is not
        // re-gated; approval survives the rewrite it authorized.
        state.needs_approval = requires_approval && !state.approved;

        state.node_finished("validate", NodeStatus::Completed, None);
        Ok(Transition::Next(NodeKind::AwaitApproval))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_select_and_cte() {
        assert!(basic_sql_checks("SELECT * FROM t").is_ok());
        assert!(basic_sql_checks("WITH x AS (SELECT 1 FROM dual) SELECT * FROM x").is_ok());
    }

    #[test]
    fn rejects_destructive_statements() {
        assert!(basic_sql_checks("DROP TABLE t").is_err());
        assert!(basic_sql_checks("SELECT * FROM t; DELETE FROM t").is_err());
        assert!(basic_sql_checks("").is_err());
    }

    #[test]
    fn destructive_words_inside_strings_are_fine() {
        assert!(basic_sql_checks("SELECT * FROM log WHERE msg = 'DROP TABLE'").is_ok());
    }

    #[test]
    fn row_limit_detection() {
        assert!(has_row_limit("SELECT * FROM t FETCH FIRST 10 ROWS ONLY"));
        assert!(has_row_limit("SELECT * FROM t LIMIT 5"));
        assert!(!has_row_limit("SELECT * FROM t"));
    }
}
