//! Node execution framework for the orchestration state machine.
//!
//! A [`Node`] is one unit of the pipeline: it receives mutable access to
//! the query's [`QueryState`], does its work (LLM call, retrieval,
//! validation, execution), and answers with a [`Transition`] telling the
//! engine where to go next. Nodes never pick arbitrary successors; the
//! engine checks every transition against the static routing table.
//!
//! # Error handling
//!
//! Fatal failures return [`NodeError`]; the engine applies the node's
//! retry policy and, once exhausted, records the error into state and
//! routes to the terminal error node. Failures a node can absorb
//! (empty retrieval context, analysis hiccups) are handled inside the node
//! and simply produce the next transition.

use async_trait::async_trait;
use miette::Diagnostic;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::config::Settings;
use crate::db::{DatabaseRouter, DbError, DbErrorKind};
use crate::kv::KvStore;
use crate::lifecycle::{LifecycleBus, LifecycleEvent, QueryPhase};
use crate::llm::{CompletionRequest, CompletionResponse, LanguageModel, LlmError};
use crate::message::Message;
use crate::results::ResultStore;
use crate::state::QueryState;
use crate::types::NodeKind;

/// Why the engine suspended instead of continuing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SuspendReason {
    /// Waiting for a human approval decision.
    PendingApproval,
    /// Waiting for the user to clarify an ambiguous request.
    PendingClarification,
}

/// Terminal outcome of a query run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Terminal {
    Finished,
    Failed,
    Rejected,
}

/// A node's answer: where the state machine goes next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// Continue to a declared successor node.
    Next(NodeKind),
    /// Checkpoint and stop; an external event resumes the thread.
    Suspend(SuspendReason),
    /// Stop for good and emit the matching terminal lifecycle event.
    Terminal(Terminal),
}

/// Fatal errors a node can raise to the engine.
#[derive(Debug, Error, Diagnostic)]
pub enum NodeError {
    /// Expected input data missing from state.
    #[error("missing expected input: {what}")]
    #[diagnostic(
        code(amila::node::missing_input),
        help("Check that the preceding node produced the required data: {what}.")
    )]
    MissingInput { what: &'static str },

    /// User input or generated SQL failed pre-execution validation.
    #[error("validation failed: {0}")]
    #[diagnostic(code(amila::node::validation))]
    Validation(String),

    /// LLM call failed or returned unusable output.
    #[error(transparent)]
    #[diagnostic(code(amila::node::llm))]
    Llm(#[from] LlmError),

    /// Database call failed (classified by the adapter).
    #[error(transparent)]
    #[diagnostic(code(amila::node::db))]
    Db(#[from] DbError),

    /// JSON (de)serialization failure.
    #[error(transparent)]
    #[diagnostic(code(amila::node::serde))]
    Serde(#[from] serde_json::Error),

    /// Anything unexpected; always logged with its category.
    #[error("internal error: {0}")]
    #[diagnostic(code(amila::node::internal))]
    Internal(String),
}

impl NodeError {
    /// Error-taxonomy label recorded into state and surfaced to clients.
    #[must_use]
    pub fn kind_label(&self) -> &'static str {
        match self {
            NodeError::MissingInput { .. } | NodeError::Validation(_) => "validation_error",
            NodeError::Llm(_) => "llm_error",
            NodeError::Db(err) => match err.kind {
                DbErrorKind::CircuitOpen => "circuit_open",
                DbErrorKind::Connection | DbErrorKind::Timeout | DbErrorKind::Transient => {
                    "db_error.recoverable"
                }
                _ => "db_error.non_recoverable",
            },
            NodeError::Serde(_) | NodeError::Internal(_) => "internal_error",
        }
    }

    /// Whether the engine may retry the node for this error.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        match self {
            NodeError::Llm(LlmError::Timeout(_)) => true,
            NodeError::Llm(LlmError::Provider { .. }) => true,
            NodeError::Db(err) => matches!(
                err.kind,
                DbErrorKind::Connection | DbErrorKind::Timeout | DbErrorKind::Transient
            ),
            _ => false,
        }
    }
}

/// Shared services every node can reach: the dependency container slice
/// that crosses into node execution.
pub struct Services {
    pub settings: Arc<Settings>,
    pub llm: Arc<dyn LanguageModel>,
    pub database: Arc<DatabaseRouter>,
    pub results: Arc<ResultStore>,
    pub lifecycle: Arc<LifecycleBus>,
    pub kv: Arc<dyn KvStore>,
}

/// Execution context handed to a node for one run.
#[derive(Clone)]
pub struct NodeContext {
    /// The node being executed.
    pub node: NodeKind,
    /// Retry attempt number (0 = first try).
    pub attempt: u32,
    pub services: Arc<Services>,
}

impl NodeContext {
    /// Publish a lifecycle event for this query, stamping the node name as
    /// `stage` and propagating the trace id.
    pub async fn emit(&self, state: &QueryState, phase: QueryPhase, metadata: Value) {
        let event = crate::lifecycle::event_with_stage(
            &state.query_id,
            phase,
            self.node.encode(),
            metadata,
            state.trace_id.as_deref(),
        );
        self.services.lifecycle.publish(event).await;
    }

    /// Publish a prebuilt lifecycle event.
    pub async fn emit_event(&self, event: LifecycleEvent) {
        self.services.lifecycle.publish(event).await;
    }

    /// Run one LLM completion with the configured deadline and fold token
    /// usage into the query's metadata.
    pub async fn complete(
        &self,
        state: &mut QueryState,
        system: &str,
        messages: Vec<Message>,
    ) -> Result<CompletionResponse, LlmError> {
        let request = CompletionRequest::new(system, messages)
            .with_deadline(self.services.settings.llm_deadline);
        let response = self.services.llm.complete(request).await?;
        state.llm_metadata.record_usage(
            self.services.llm.provider(),
            self.services.llm.model(),
            response.usage.prompt_tokens,
            response.usage.completion_tokens,
        );
        Ok(response)
    }

    /// Schema-context token budget for the active provider.
    #[must_use]
    pub fn context_budget(&self) -> usize {
        self.services
            .settings
            .token_budget(self.services.llm.provider())
    }
}

/// One unit of computation in the pipeline.
#[async_trait]
pub trait Node: Send + Sync {
    /// Execute this node against the query state.
    async fn run(&self, state: &mut QueryState, ctx: &NodeContext)
    -> Result<Transition, NodeError>;
}
