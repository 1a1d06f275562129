//! Per-query working state for the orchestration pipeline.
//!
//! [`QueryState`] is the single record the engine threads through the node
//! pipeline: created on submission, mutated only by the currently running
//! node, checkpointed at every node boundary. All fields are typed rather
//! than map-shaped so invalid intermediate states are unrepresentable.
//!
//! History lists are bounded ([`MAX_NODE_HISTORY`],
//! [`MAX_CLARIFICATION_HISTORY`]) and trimmed on write to keep checkpoints
//! from growing without limit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::message::Message;
use crate::types::DatabaseType;

/// Upper bound on retained `node_history` entries.
pub const MAX_NODE_HISTORY: usize = 50;
/// Upper bound on retained `clarification_history` entries.
pub const MAX_CLARIFICATION_HISTORY: usize = 10;

/// Maximum automatic SQL repairs per query.
pub const MAX_REPAIR_ATTEMPTS: u32 = 2;
/// Maximum fallback SQL generations per query.
pub const MAX_FALLBACK_ATTEMPTS: u32 = 1;
/// Maximum strategy pivots per query.
pub const MAX_PIVOT_ATTEMPTS: u32 = 2;

/// Pre-execution validation verdict for generated SQL.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ValidationReport {
    pub is_valid: bool,
    pub risk_level: RiskLevel,
    pub requires_approval: bool,
    #[serde(default)]
    pub warnings: Vec<String>,
}

/// Coarse risk classification assigned during validation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskLevel {
    #[default]
    Low,
    Medium,
    High,
}

/// Canonical result rows for a completed execution.
///
/// Also the shape cached by the result store; `row_count` equals
/// `rows.len()` unless `truncated` marks an adapter-boundary cut.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ExecutionResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub execution_time_ms: u64,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_quality: Option<Value>,
    #[serde(default)]
    pub truncated: bool,
}

impl ExecutionResult {
    /// Build a result from columns and rows, stamping `row_count`.
    #[must_use]
    pub fn new(columns: Vec<String>, rows: Vec<Vec<Value>>, execution_time_ms: u64) -> Self {
        let row_count = rows.len();
        Self {
            columns,
            rows,
            row_count,
            execution_time_ms,
            timestamp: Some(Utc::now()),
            data_quality: None,
            truncated: false,
        }
    }
}

/// Post-execution quality analysis attached by `validate_results`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct ResultAnalysis {
    /// 0–100 quality score; below threshold triggers a pivot.
    pub quality_score: u8,
    #[serde(default)]
    pub issues: Vec<String>,
    pub acceptable: bool,
}

/// Optimizer cost summary surfaced for observability.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct CostEstimate {
    pub total_cost: f64,
    pub cardinality: u64,
    pub cost_level: String,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

/// Rendering hint attached by `format_results`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct VisualizationHints {
    pub chart_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub x_axis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub y_axis: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Retrieved context for SQL generation: schema metadata plus semantic
/// retrieval hits. Empty context is acceptable (retrieval is non-fatal).
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct QueryContext {
    /// `tables: {name: [{name, type, nullable}]}` shape from the router.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema_metadata: Option<Value>,
    #[serde(default)]
    pub semantic_hits: Vec<String>,
    /// Whether the knowledge-graph store answered during retrieval.
    #[serde(default)]
    pub graphiti_available: bool,
}

impl QueryContext {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.schema_metadata.is_none() && self.semantic_hits.is_empty()
    }
}

/// One sub-query produced by multi-part decomposition.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct SubQuery {
    pub index: usize,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sql: Option<String>,
}

/// Structured error detail captured alongside `error` / `error_stage`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ErrorPayload {
    pub stage: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Status of one node execution in `node_history`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeStatus {
    #[serde(rename = "pending")]
    Pending,
    #[serde(rename = "in-progress")]
    InProgress,
    #[serde(rename = "completed")]
    Completed,
    #[serde(rename = "failed")]
    Failed,
}

/// One reasoning step surfaced to the frontend execution panel.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ThinkingStep {
    pub id: String,
    pub content: String,
    pub status: String,
    pub timestamp: DateTime<Utc>,
}

impl ThinkingStep {
    #[must_use]
    pub fn completed(id: &str, content: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            content: content.into(),
            status: "completed".to_string(),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn in_progress(id: &str, content: impl Into<String>) -> Self {
        Self {
            id: id.to_string(),
            content: content.into(),
            status: "in-progress".to_string(),
            timestamp: Utc::now(),
        }
    }
}

/// One entry of the bounded node execution history.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct NodeRecord {
    pub name: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub thinking_steps: Vec<ThinkingStep>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One clarification turn retained for multi-turn context.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ClarificationRecord {
    pub clarification: String,
    pub timestamp: DateTime<Utc>,
}

/// LLM provider/model bookkeeping and token accounting for one query.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq)]
pub struct LlmMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub calls: u32,
}

impl LlmMetadata {
    /// Fold one completion's usage into the running totals.
    pub fn record_usage(&mut self, provider: &str, model: &str, prompt: u64, completion: u64) {
        self.provider = Some(provider.to_string());
        self.model = Some(model.to_string());
        self.prompt_tokens += prompt;
        self.completion_tokens += completion;
        self.calls += 1;
    }
}

/// The orchestrator's working memory for one query.
///
/// Created on submission, serialized into a checkpoint after every node,
/// destroyed when checkpoint retention expires.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct QueryState {
    // Identity
    pub query_id: String,
    /// Stable id for checkpoint resumption; distinct from `query_id` so a
    /// conversation thread can span multiple queries.
    pub thread_id: String,
    pub user_id: String,
    pub user_role: String,
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,

    // Input
    pub user_query: String,
    pub database_type: DatabaseType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_name: Option<String>,

    // Conversation context for LLM calls
    #[serde(default)]
    pub messages: Vec<Message>,

    // Derived artifacts
    #[serde(default)]
    pub intent: String,
    #[serde(default)]
    pub hypothesis: String,
    #[serde(default)]
    pub context: QueryContext,
    #[serde(default)]
    pub sql_query: String,
    /// Confidence score 0–100 attached by SQL generation.
    #[serde(default)]
    pub sql_confidence: u8,

    // Execution artifacts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation_result: Option<ValidationReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_result: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_analysis: Option<ResultAnalysis>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost_estimate: Option<CostEstimate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_plan: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visualization_hints: Option<VisualizationHints>,

    // Multi-part decomposition
    #[serde(default)]
    pub sub_queries: Vec<SubQuery>,
    /// Cursor into `sub_queries` while a decomposed query is in flight;
    /// `None` for single-part queries and after the last sub-query.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_sub_query: Option<usize>,
    /// Concatenated results of the sub-queries executed so far.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combined_result: Option<ExecutionResult>,

    // Control flow
    #[serde(default)]
    pub needs_approval: bool,
    #[serde(default)]
    pub approved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rejection_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_stage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_payload: Option<ErrorPayload>,
    #[serde(default)]
    pub repair_attempts: u32,
    #[serde(default)]
    pub fallback_attempts: u32,
    #[serde(default)]
    pub pivot_attempts: u32,
    #[serde(default)]
    pub pivot_strategies: Vec<String>,

    // Clarification flow
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub clarification_message: Option<String>,
    #[serde(default)]
    pub clarification_history: Vec<ClarificationRecord>,

    // Observability (bounded)
    #[serde(default)]
    pub node_history: Vec<NodeRecord>,
    #[serde(default)]
    pub current_node: String,
    #[serde(default)]
    pub llm_metadata: LlmMetadata,

    pub created_at: DateTime<Utc>,
}

impl QueryState {
    /// Build the initial state for a freshly submitted query.
    #[must_use]
    pub fn new(query_id: &str, thread_id: &str, user_query: &str, database: DatabaseType) -> Self {
        Self {
            query_id: query_id.to_string(),
            thread_id: thread_id.to_string(),
            user_id: String::new(),
            user_role: "viewer".to_string(),
            session_id: String::new(),
            trace_id: None,
            user_query: user_query.to_string(),
            database_type: database,
            connection_name: None,
            messages: vec![Message::user(user_query)],
            intent: String::new(),
            hypothesis: String::new(),
            context: QueryContext::default(),
            sql_query: String::new(),
            sql_confidence: 0,
            validation_result: None,
            execution_result: None,
            result_analysis: None,
            cost_estimate: None,
            execution_plan: None,
            visualization_hints: None,
            sub_queries: Vec::new(),
            active_sub_query: None,
            combined_result: None,
            needs_approval: false,
            approved: false,
            rejection_reason: None,
            error: None,
            error_stage: None,
            error_payload: None,
            repair_attempts: 0,
            fallback_attempts: 0,
            pivot_attempts: 0,
            pivot_strategies: Vec::new(),
            clarification_message: None,
            clarification_history: Vec::new(),
            node_history: Vec::new(),
            current_node: String::new(),
            llm_metadata: LlmMetadata::default(),
            created_at: Utc::now(),
        }
    }

    /// Record a node entering execution in the bounded history.
    pub fn node_started(&mut self, name: &str, steps: Vec<ThinkingStep>) {
        self.current_node = name.to_string();
        if let Some(record) = self.node_history.iter_mut().rev().find(|r| r.name == name) {
            record.status = NodeStatus::InProgress;
            if record.start_time.is_none() {
                record.start_time = Some(Utc::now());
            }
            if !steps.is_empty() {
                record.thinking_steps = steps;
            }
            return;
        }
        self.node_history.push(NodeRecord {
            name: name.to_string(),
            status: NodeStatus::InProgress,
            start_time: Some(Utc::now()),
            end_time: None,
            thinking_steps: steps,
            error: None,
        });
        self.trim_histories();
    }

    /// Record a node finishing (completed or failed) in the bounded history.
    pub fn node_finished(&mut self, name: &str, status: NodeStatus, error: Option<String>) {
        if let Some(record) = self.node_history.iter_mut().rev().find(|r| r.name == name) {
            record.status = status;
            record.end_time = Some(Utc::now());
            record.error = error;
        } else {
            self.node_history.push(NodeRecord {
                name: name.to_string(),
                status,
                start_time: None,
                end_time: Some(Utc::now()),
                thinking_steps: Vec::new(),
                error,
            });
        }
        self.trim_histories();
    }

    /// Append a thinking step to the latest record for `name`.
    pub fn push_thinking_step(&mut self, name: &str, step: ThinkingStep) {
        if let Some(record) = self.node_history.iter_mut().rev().find(|r| r.name == name) {
            record.thinking_steps.push(step);
        }
    }

    /// Populate the structured error triple and mark the stage failed.
    pub fn set_error(&mut self, stage: &str, message: impl Into<String>, details: Option<Value>) {
        let message = message.into();
        self.error = Some(message.clone());
        self.error_stage = Some(stage.to_string());
        self.error_payload = Some(ErrorPayload {
            stage: stage.to_string(),
            message: message.clone(),
            details,
        });
        self.node_finished(stage, NodeStatus::Failed, Some(message));
    }

    /// Append a clarification turn, keeping the history bounded.
    pub fn push_clarification(&mut self, clarification: &str) {
        self.clarification_history.push(ClarificationRecord {
            clarification: clarification.to_string(),
            timestamp: Utc::now(),
        });
        self.messages.push(Message::user(clarification));
        self.trim_histories();
    }

    /// The request text the SQL-producing nodes should work from: the
    /// active sub-query when a decomposed query is in flight, otherwise
    /// the original question.
    #[must_use]
    pub fn active_request(&self) -> &str {
        self.active_sub_query
            .and_then(|index| self.sub_queries.get(index))
            .map_or(self.user_query.as_str(), |sub| sub.text.as_str())
    }

    /// True while every loop counter is within its cap.
    ///
    /// `repair + fallback + pivot` can never exceed 6 when the individual
    /// caps hold; this is the invariant the property tests assert.
    #[must_use]
    pub fn attempts_within_caps(&self) -> bool {
        self.repair_attempts <= MAX_REPAIR_ATTEMPTS
            && self.fallback_attempts <= MAX_FALLBACK_ATTEMPTS
            && self.pivot_attempts <= MAX_PIVOT_ATTEMPTS
    }

    fn trim_histories(&mut self) {
        if self.node_history.len() > MAX_NODE_HISTORY {
            let excess = self.node_history.len() - MAX_NODE_HISTORY;
            self.node_history.drain(..excess);
        }
        if self.clarification_history.len() > MAX_CLARIFICATION_HISTORY {
            let excess = self.clarification_history.len() - MAX_CLARIFICATION_HISTORY;
            self.clarification_history.drain(..excess);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_history_is_bounded() {
        let mut state = QueryState::new("q1", "t1", "hello", DatabaseType::Oracle);
        for i in 0..(MAX_NODE_HISTORY + 10) {
            state.node_started(&format!("node-{i}"), vec![]);
        }
        assert_eq!(state.node_history.len(), MAX_NODE_HISTORY);
        // Oldest entries were dropped, newest kept.
        assert_eq!(
            state.node_history.last().map(|r| r.name.as_str()),
            Some(format!("node-{}", MAX_NODE_HISTORY + 9).as_str())
        );
    }

    #[test]
    fn node_finished_updates_latest_record() {
        let mut state = QueryState::new("q1", "t1", "hello", DatabaseType::Oracle);
        state.node_started("understand", vec![]);
        state.node_finished("understand", NodeStatus::Completed, None);
        let record = state.node_history.last().unwrap();
        assert_eq!(record.status, NodeStatus::Completed);
        assert!(record.start_time.is_some());
        assert!(record.end_time.is_some());
    }

    #[test]
    fn set_error_populates_payload_and_history() {
        let mut state = QueryState::new("q1", "t1", "hello", DatabaseType::Oracle);
        state.set_error("generate_sql", "llm unavailable", None);
        assert_eq!(state.error.as_deref(), Some("llm unavailable"));
        assert_eq!(state.error_stage.as_deref(), Some("generate_sql"));
        let payload = state.error_payload.as_ref().unwrap();
        assert_eq!(payload.stage, "generate_sql");
        assert_eq!(
            state.node_history.last().map(|r| r.status),
            Some(NodeStatus::Failed)
        );
    }

    #[test]
    fn active_request_follows_the_sub_query_cursor() {
        let mut state = QueryState::new("q1", "t1", "full question", DatabaseType::Oracle);
        assert_eq!(state.active_request(), "full question");
        state.sub_queries = vec![
            SubQuery {
                index: 0,
                text: "first part".to_string(),
                sql: None,
            },
            SubQuery {
                index: 1,
                text: "second part".to_string(),
                sql: None,
            },
        ];
        state.active_sub_query = Some(1);
        assert_eq!(state.active_request(), "second part");
        state.active_sub_query = None;
        assert_eq!(state.active_request(), "full question");
    }

    #[test]
    fn clarification_history_is_bounded() {
        let mut state = QueryState::new("q1", "t1", "hello", DatabaseType::Oracle);
        for i in 0..(MAX_CLARIFICATION_HISTORY + 5) {
            state.push_clarification(&format!("more detail {i}"));
        }
        assert_eq!(
            state.clarification_history.len(),
            MAX_CLARIFICATION_HISTORY
        );
    }
}
