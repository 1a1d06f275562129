//! The orchestrator engine: drives one query through the node pipeline.
//!
//! Execution is strictly serial per query. The engine loads the latest
//! checkpoint, runs the next node, validates the returned transition
//! against the routing table (fail-closed), persists a fresh checkpoint,
//! and repeats until a node suspends or terminates the pipeline.
//!
//! Retries are engine-scheduled, not node-internal: `generate_sql` and
//! `execute` get two extra attempts with exponential backoff,
//! `generate_fallback_sql` one, everything else none.

use rustc_hash::FxHashMap;
use serde_json::json;
use std::sync::Arc;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use super::checkpoint::{Checkpoint, Checkpointer, CheckpointerError};
use super::routing;
use crate::lifecycle::{LifecycleEvent, QueryPhase, event_with_stage};
use crate::node::{Node, NodeContext, NodeError, Services, SuspendReason, Terminal, Transition};
use crate::nodes;
use crate::resilience::BackoffPolicy;
use crate::state::QueryState;
use crate::types::{DatabaseType, NodeKind};
use crate::webhooks::WebhookDispatcher;

/// Backstop on pipeline length; the loop caps in state bound real cycles
/// well below this.
const MAX_STEPS_PER_RUN: u64 = 100;

/// A query submission entering the engine.
#[derive(Clone, Debug, Default)]
pub struct SubmitRequest {
    pub query: String,
    pub user_id: Option<String>,
    pub user_role: Option<String>,
    pub session_id: Option<String>,
    pub database_type: DatabaseType,
    pub connection_name: Option<String>,
    /// Reuse an existing thread for resumption/conversation continuity.
    pub thread_id: Option<String>,
}

/// Where a drive of the state machine left the query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunStatus {
    Finished,
    Failed,
    Rejected,
    PendingApproval,
    PendingClarification,
    /// Non-terminal checkpoint that is not a suspension point; only seen
    /// when inspecting a thread mid-flight.
    InProgress,
}

/// Result of driving a query until suspension or termination.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub state: QueryState,
}

#[derive(Debug, Error, miette::Diagnostic)]
pub enum EngineError {
    #[error("routing table invalid at node {0}")]
    #[diagnostic(code(amila::engine::routing))]
    InvalidRouting(NodeKind),

    #[error("illegal transition {from} -> {to}")]
    #[diagnostic(
        code(amila::engine::illegal_transition),
        help("The node returned a successor outside its declared set; this is a programming error.")
    )]
    IllegalTransition { from: NodeKind, to: NodeKind },

    #[error("unknown thread: {0}")]
    #[diagnostic(code(amila::engine::unknown_thread))]
    UnknownThread(String),

    #[error("thread {0} is not awaiting approval")]
    #[diagnostic(code(amila::engine::not_pending))]
    NotPendingApproval(String),

    #[error(transparent)]
    #[diagnostic(code(amila::engine::checkpointer))]
    Checkpointer(#[from] CheckpointerError),

    #[error("step limit exceeded for thread {0}")]
    #[diagnostic(code(amila::engine::step_limit))]
    StepLimitExceeded(String),
}

/// The per-query state machine driver.
pub struct Orchestrator {
    services: Arc<Services>,
    nodes: FxHashMap<NodeKind, Arc<dyn Node>>,
    checkpointer: Arc<dyn Checkpointer>,
    webhooks: Option<Arc<WebhookDispatcher>>,
    node_backoff: BackoffPolicy,
}

impl Orchestrator {
    /// Build an engine with the default node set. Validates the routing
    /// table up front and refuses to start on any violation.
    pub fn new(
        services: Arc<Services>,
        checkpointer: Arc<dyn Checkpointer>,
    ) -> Result<Self, EngineError> {
        routing::validate_table().map_err(EngineError::InvalidRouting)?;
        Ok(Self {
            nodes: nodes::default_nodes(),
            services,
            checkpointer,
            webhooks: None,
            node_backoff: BackoffPolicy::default(),
        })
    }

    /// Attach the webhook dispatcher for terminal-event fan-out.
    #[must_use]
    pub fn with_webhooks(mut self, webhooks: Arc<WebhookDispatcher>) -> Self {
        self.webhooks = Some(webhooks);
        self
    }

    /// Override the engine retry backoff (tests use millisecond delays).
    #[must_use]
    pub fn with_node_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.node_backoff = backoff;
        self
    }

    #[must_use]
    pub fn services(&self) -> Arc<Services> {
        self.services.clone()
    }

    #[must_use]
    pub fn checkpointer(&self) -> Arc<dyn Checkpointer> {
        self.checkpointer.clone()
    }

    /// Submit a new query: persist the initial checkpoint, emit `received`,
    /// and drive until suspension or termination.
    #[instrument(skip(self, request), fields(db = %request.database_type))]
    pub async fn submit(&self, request: SubmitRequest) -> Result<RunOutcome, EngineError> {
        let query_id = Uuid::new_v4().to_string();
        let thread_id = request
            .thread_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let mut state = QueryState::new(
            &query_id,
            &thread_id,
            &request.query,
            request.database_type,
        );
        state.trace_id = Some(Uuid::new_v4().to_string());
        if let Some(user_id) = request.user_id {
            state.user_id = user_id;
        }
        if let Some(user_role) = request.user_role {
            state.user_role = user_role;
        }
        if let Some(session_id) = request.session_id {
            state.session_id = session_id;
        }
        state.connection_name = request.connection_name;

        self.checkpointer
            .save(Checkpoint::new(
                &thread_id,
                0,
                Some(routing::ENTRY),
                state.clone(),
            ))
            .await?;

        // Query-id to thread-id mapping for the approve/clarify/stream
        // endpoints, retained as long as the checkpoints are.
        let _ = self
            .services
            .kv
            .set(
                &format!("qthread:{query_id}"),
                thread_id.clone(),
                Some(self.services.settings.retention()),
            )
            .await;

        self.services
            .lifecycle
            .publish(
                LifecycleEvent::new(
                    &query_id,
                    QueryPhase::Received,
                    json!({
                        "query": state.user_query,
                        "database_type": state.database_type,
                    }),
                )
                .with_trace_id(state.trace_id.clone()),
            )
            .await;

        self.drive(&thread_id).await
    }

    /// Resume a thread from its latest checkpoint.
    ///
    /// Resuming an already-terminal thread is idempotent: it returns the
    /// recorded outcome without re-running nodes or re-emitting events.
    #[instrument(skip(self))]
    pub async fn resume(&self, thread_id: &str) -> Result<RunOutcome, EngineError> {
        let checkpoint = self
            .checkpointer
            .load_latest(thread_id)
            .await?
            .ok_or_else(|| EngineError::UnknownThread(thread_id.to_string()))?;
        if checkpoint.next_node.is_none() {
            return Ok(outcome_from_checkpoint(&checkpoint));
        }
        self.drive(thread_id).await
    }

    /// Resolve the thread id a query id was submitted under.
    pub async fn thread_for_query(&self, query_id: &str) -> Option<String> {
        self.services
            .kv
            .get(&format!("qthread:{query_id}"))
            .await
            .ok()
            .flatten()
    }

    /// Current status of a thread without driving it.
    pub async fn inspect(&self, thread_id: &str) -> Result<RunOutcome, EngineError> {
        let checkpoint = self
            .checkpointer
            .load_latest(thread_id)
            .await?
            .ok_or_else(|| EngineError::UnknownThread(thread_id.to_string()))?;
        Ok(outcome_from_checkpoint(&checkpoint))
    }

    async fn drive(&self, thread_id: &str) -> Result<RunOutcome, EngineError> {
        let checkpoint = self
            .checkpointer
            .load_latest(thread_id)
            .await?
            .ok_or_else(|| EngineError::UnknownThread(thread_id.to_string()))?;

        let mut state = checkpoint.state;
        let mut step = checkpoint.step;
        let mut current = checkpoint.next_node;
        let mut last_phase: Option<QueryPhase> = None;

        while let Some(node_kind) = current {
            if step >= MAX_STEPS_PER_RUN {
                state.set_error(
                    node_kind.encode(),
                    "step limit exceeded",
                    Some(json!({"category": "internal_error"})),
                );
                self.finish(thread_id, step + 1, &mut state, Terminal::Failed)
                    .await?;
                return Err(EngineError::StepLimitExceeded(thread_id.to_string()));
            }

            if let Some(phase) = progress_phase(node_kind) {
                if last_phase != Some(phase) {
                    self.services
                        .lifecycle
                        .publish(event_with_stage(
                            &state.query_id,
                            phase,
                            node_kind.encode(),
                            json!({"current_node": node_kind.encode()}),
                            state.trace_id.as_deref(),
                        ))
                        .await;
                    last_phase = Some(phase);
                }
            }

            let transition = match self.run_node(node_kind, &mut state).await {
                Ok(transition) => transition,
                Err(err) => {
                    tracing::error!(
                        node = %node_kind,
                        category = err.kind_label(),
                        error = %err,
                        "node failed; routing to terminal error"
                    );
                    state.set_error(
                        node_kind.encode(),
                        err.to_string(),
                        Some(json!({"category": err.kind_label()})),
                    );
                    Transition::Next(NodeKind::Error)
                }
            };
            step += 1;

            match transition {
                Transition::Next(to) => {
                    // The error node is reachable from everywhere; all
                    // other transitions must be declared.
                    if to != NodeKind::Error && !routing::is_allowed(node_kind, to) {
                        state.set_error(
                            node_kind.encode(),
                            format!("illegal transition {node_kind} -> {to}"),
                            Some(json!({"category": "internal_error"})),
                        );
                        self.save(thread_id, step, Some(NodeKind::Error), &state)
                            .await?;
                        current = Some(NodeKind::Error);
                        continue;
                    }
                    self.save(thread_id, step, Some(to), &state).await?;
                    current = Some(to);
                }
                Transition::Suspend(reason) => {
                    // Re-enter the suspending node once the external event
                    // arrives.
                    self.save(thread_id, step, Some(node_kind), &state).await?;
                    let status = match reason {
                        SuspendReason::PendingApproval => RunStatus::PendingApproval,
                        SuspendReason::PendingClarification => RunStatus::PendingClarification,
                    };
                    return Ok(RunOutcome { status, state });
                }
                Transition::Terminal(terminal) => {
                    return self.finish(thread_id, step, &mut state, terminal).await;
                }
            }
        }

        // next_node was None: thread already terminal.
        Ok(RunOutcome {
            status: terminal_status(&state),
            state,
        })
    }

    async fn run_node(
        &self,
        kind: NodeKind,
        state: &mut QueryState,
    ) -> Result<Transition, NodeError> {
        let node = self
            .nodes
            .get(&kind)
            .cloned()
            .ok_or_else(|| NodeError::Internal(format!("no node registered for {kind}")))?;
        let max_retries = retry_budget(kind);
        let mut attempt = 0u32;
        loop {
            let ctx = NodeContext {
                node: kind,
                attempt,
                services: self.services.clone(),
            };
            match node.run(state, &ctx).await {
                Ok(transition) => return Ok(transition),
                Err(err) if err.is_retryable() && attempt < max_retries => {
                    let delay = self.node_backoff.delay(attempt);
                    tracing::warn!(
                        node = %kind,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "node retry scheduled"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn finish(
        &self,
        thread_id: &str,
        step: u64,
        state: &mut QueryState,
        terminal: Terminal,
    ) -> Result<RunOutcome, EngineError> {
        self.save(thread_id, step, None, state).await?;

        let (phase, metadata) = match terminal {
            Terminal::Finished => {
                let result_meta = state.execution_result.as_ref().map(|result| {
                    let mut preview = result.clone();
                    preview.rows.truncate(50);
                    json!({
                        "columns": preview.columns,
                        "rows": preview.rows,
                        "row_count": result.row_count,
                    })
                });
                (
                    QueryPhase::Finished,
                    json!({
                        "sql": state.sql_query,
                        "result": result_meta,
                        "visualization_hints": state.visualization_hints,
                    }),
                )
            }
            Terminal::Failed => (
                QueryPhase::Error,
                json!({
                    "error": state.error,
                    "stage": state.error_stage,
                    "details": state.error_payload,
                }),
            ),
            Terminal::Rejected => (
                QueryPhase::Rejected,
                json!({"reason": state.rejection_reason}),
            ),
        };

        let event = LifecycleEvent::new(&state.query_id, phase, metadata)
            .with_trace_id(state.trace_id.clone());
        let published = self.services.lifecycle.publish(event.clone()).await;

        if published {
            if let Some(webhooks) = &self.webhooks {
                webhooks.dispatch_terminal(&state.user_id, &event).await;
            }
        }

        let status = match terminal {
            Terminal::Finished => RunStatus::Finished,
            Terminal::Failed => RunStatus::Failed,
            Terminal::Rejected => RunStatus::Rejected,
        };
        Ok(RunOutcome {
            status,
            state: state.clone(),
        })
    }

    async fn save(
        &self,
        thread_id: &str,
        step: u64,
        next: Option<NodeKind>,
        state: &QueryState,
    ) -> Result<(), EngineError> {
        self.checkpointer
            .save(Checkpoint::new(thread_id, step, next, state.clone()))
            .await?;
        Ok(())
    }
}

/// Engine-scheduled retry budget per node.
fn retry_budget(kind: NodeKind) -> u32 {
    match kind {
        NodeKind::GenerateSql | NodeKind::Execute => 2,
        NodeKind::GenerateFallbackSql => 1,
        _ => 0,
    }
}

/// Progress phase emitted when entering a node. Suspension and terminal
/// nodes publish their own events.
fn progress_phase(kind: NodeKind) -> Option<QueryPhase> {
    match kind {
        NodeKind::Understand
        | NodeKind::RetrieveContext
        | NodeKind::Decompose
        | NodeKind::GenerateHypothesis => Some(QueryPhase::Planning),
        NodeKind::GenerateSql | NodeKind::RepairSql | NodeKind::GenerateFallbackSql => {
            Some(QueryPhase::GeneratingSql)
        }
        NodeKind::Validate | NodeKind::ProbeSql => Some(QueryPhase::Validating),
        NodeKind::Execute => Some(QueryPhase::Executing),
        NodeKind::ValidateResults | NodeKind::PivotStrategy => Some(QueryPhase::ValidatingResults),
        NodeKind::AwaitApproval | NodeKind::FormatResults | NodeKind::Error => None,
    }
}

fn terminal_status(state: &QueryState) -> RunStatus {
    if state.rejection_reason.is_some() {
        RunStatus::Rejected
    } else if state.error.is_some() && state.execution_result.is_none() {
        RunStatus::Failed
    } else {
        RunStatus::Finished
    }
}

/// Derive an outcome from a checkpoint without driving the machine.
#[must_use]
pub fn outcome_from_checkpoint(checkpoint: &Checkpoint) -> RunOutcome {
    let status = match checkpoint.next_node {
        None => terminal_status(&checkpoint.state),
        Some(NodeKind::AwaitApproval) => RunStatus::PendingApproval,
        Some(NodeKind::GenerateSql) if checkpoint.state.clarification_message.is_some() => {
            RunStatus::PendingClarification
        }
        Some(_) => RunStatus::InProgress,
    };
    RunOutcome {
        status,
        state: checkpoint.state.clone(),
    }
}
