//! Core identifiers for the query orchestration pipeline.
//!
//! [`NodeKind`] names the nodes of the state machine and [`DatabaseType`]
//! names the SQL backends a query can target. Both serialize into stable
//! string forms for checkpoint persistence.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifies a node of the query orchestration state machine.
///
/// Unlike a general workflow graph, the pipeline has a closed set of nodes;
/// an enum keeps the routing table total and lets the compiler check match
/// exhaustiveness wherever a node is dispatched.
///
/// # Persistence
///
/// `NodeKind` round-trips through [`encode`](Self::encode) /
/// [`decode`](Self::decode) for checkpoint storage.
///
/// # Examples
///
/// ```rust
/// use amila::types::NodeKind;
///
/// let node = NodeKind::GenerateSql;
/// assert_eq!(node.encode(), "generate_sql");
/// assert_eq!(NodeKind::decode("generate_sql"), Some(NodeKind::GenerateSql));
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeKind {
    /// Intent classification from the raw user query.
    Understand,
    /// Schema metadata + semantic example retrieval.
    RetrieveContext,
    /// Multi-part query detection and sub-query planning.
    Decompose,
    /// Free-form query execution plan from the LLM.
    GenerateHypothesis,
    /// SQL generation from hypothesis + context.
    GenerateSql,
    /// Pre-execution validation of the generated SQL.
    Validate,
    /// Structural dry-run (Oracle only, when eligible).
    ProbeSql,
    /// Human-in-the-loop approval gate; suspension point.
    AwaitApproval,
    /// SQL execution against the routed backend.
    Execute,
    /// Post-execution result quality analysis.
    ValidateResults,
    /// Bounded strategy change looping back to hypothesis.
    PivotStrategy,
    /// Bounded SQL rewrite after a recoverable execution error.
    RepairSql,
    /// Simpler SQL variant once repair is exhausted.
    GenerateFallbackSql,
    /// Terminal formatting and visualization hints.
    FormatResults,
    /// Terminal error node.
    Error,
}

impl NodeKind {
    /// All nodes, in pipeline order. Used by routing-table validation.
    pub const ALL: [NodeKind; 15] = [
        NodeKind::Understand,
        NodeKind::RetrieveContext,
        NodeKind::Decompose,
        NodeKind::GenerateHypothesis,
        NodeKind::GenerateSql,
        NodeKind::Validate,
        NodeKind::ProbeSql,
        NodeKind::AwaitApproval,
        NodeKind::Execute,
        NodeKind::ValidateResults,
        NodeKind::PivotStrategy,
        NodeKind::RepairSql,
        NodeKind::GenerateFallbackSql,
        NodeKind::FormatResults,
        NodeKind::Error,
    ];

    /// Encode into the persisted string form (snake_case node name).
    #[must_use]
    pub fn encode(&self) -> &'static str {
        match self {
            NodeKind::Understand => "understand",
            NodeKind::RetrieveContext => "retrieve_context",
            NodeKind::Decompose => "decompose",
            NodeKind::GenerateHypothesis => "generate_hypothesis",
            NodeKind::GenerateSql => "generate_sql",
            NodeKind::Validate => "validate",
            NodeKind::ProbeSql => "probe_sql",
            NodeKind::AwaitApproval => "await_approval",
            NodeKind::Execute => "execute",
            NodeKind::ValidateResults => "validate_results",
            NodeKind::PivotStrategy => "pivot_strategy",
            NodeKind::RepairSql => "repair_sql",
            NodeKind::GenerateFallbackSql => "generate_fallback_sql",
            NodeKind::FormatResults => "format_results",
            NodeKind::Error => "error",
        }
    }

    /// Decode a persisted string form back into a `NodeKind`.
    ///
    /// Returns `None` for unknown names; callers treat that as a corrupt
    /// checkpoint rather than guessing a successor.
    pub fn decode(s: &str) -> Option<Self> {
        NodeKind::ALL.iter().copied().find(|k| k.encode() == s)
    }
}

impl fmt::Display for NodeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.encode())
    }
}

/// SQL backend a query targets.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseType {
    Oracle,
    Doris,
    Postgres,
}

impl DatabaseType {
    /// Canonical lowercase name used in cache keys and transport payloads.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseType::Oracle => "oracle",
            DatabaseType::Doris => "doris",
            DatabaseType::Postgres => "postgres",
        }
    }

    /// Parse a user-supplied database type, defaulting to Oracle for
    /// anything unrecognized (the original service's behavior).
    #[must_use]
    pub fn parse_or_default(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "doris" => DatabaseType::Doris,
            "postgres" | "postgresql" => DatabaseType::Postgres,
            _ => DatabaseType::Oracle,
        }
    }
}

impl fmt::Display for DatabaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for DatabaseType {
    fn default() -> Self {
        DatabaseType::Oracle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_kind_round_trips() {
        for kind in NodeKind::ALL {
            assert_eq!(NodeKind::decode(kind.encode()), Some(kind));
        }
    }

    #[test]
    fn unknown_node_name_is_rejected() {
        assert_eq!(NodeKind::decode("Custom:probe"), None);
    }

    #[test]
    fn database_type_defaults_to_oracle() {
        assert_eq!(
            DatabaseType::parse_or_default("sqlite"),
            DatabaseType::Oracle
        );
        assert_eq!(
            DatabaseType::parse_or_default(" DORIS "),
            DatabaseType::Doris
        );
        assert_eq!(
            DatabaseType::parse_or_default("postgresql"),
            DatabaseType::Postgres
        );
    }
}
