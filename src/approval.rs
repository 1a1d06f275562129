//! Human-in-the-loop approval gate.
//!
//! The engine suspends at `await_approval` by writing a checkpoint and
//! returning; there is no live task while a decision is pending. This
//! gate applies an external decision (or clarification) to the suspended
//! checkpoint and resumes the thread.

use std::sync::Arc;
use thiserror::Error;

use crate::engine::{
    Checkpoint, EngineError, Orchestrator, RunOutcome, RunStatus, outcome_from_checkpoint,
};
use crate::types::NodeKind;

/// An external approval decision for a pending query.
#[derive(Clone, Debug)]
pub struct ApprovalDecision {
    pub approved: bool,
    /// Operator-edited SQL replacing the generated statement.
    pub edited_sql: Option<String>,
    /// Required context when rejecting.
    pub reason: Option<String>,
}

#[derive(Debug, Error, miette::Diagnostic)]
pub enum ApprovalError {
    #[error(transparent)]
    #[diagnostic(code(amila::approval::engine))]
    Engine(#[from] EngineError),

    #[error("clarification must not be empty")]
    #[diagnostic(code(amila::approval::empty_clarification))]
    EmptyClarification,
}

/// Applies decisions and clarifications to suspended threads.
pub struct ApprovalGate {
    engine: Arc<Orchestrator>,
}

impl ApprovalGate {
    #[must_use]
    pub fn new(engine: Arc<Orchestrator>) -> Self {
        Self { engine }
    }

    /// Apply an approval decision and resume the thread.
    ///
    /// Idempotent for approvals: deciding `approved` on an
    /// already-approved query returns the thread's current outcome without
    /// re-running anything.
    pub async fn decide(
        &self,
        thread_id: &str,
        decision: ApprovalDecision,
    ) -> Result<RunOutcome, ApprovalError> {
        let checkpointer = self.engine.checkpointer();
        let checkpoint = checkpointer
            .load_latest(thread_id)
            .await
            .map_err(EngineError::from)?
            .ok_or_else(|| EngineError::UnknownThread(thread_id.to_string()))?;

        if checkpoint.state.approved && decision.approved {
            return Ok(outcome_from_checkpoint(&checkpoint));
        }
        if checkpoint.next_node != Some(NodeKind::AwaitApproval) {
            return Err(EngineError::NotPendingApproval(thread_id.to_string()).into());
        }

        let mut state = checkpoint.state.clone();
        if decision.approved {
            state.approved = true;
            if let Some(edited) = decision.edited_sql.filter(|s| !s.trim().is_empty()) {
                state.sql_query = edited;
            }
        } else {
            state.rejection_reason = Some(
                decision
                    .reason
                    .filter(|r| !r.trim().is_empty())
                    .unwrap_or_else(|| "rejected by user".to_string()),
            );
        }

        checkpointer
            .save(Checkpoint::new(
                thread_id,
                checkpoint.step,
                Some(NodeKind::AwaitApproval),
                state,
            ))
            .await
            .map_err(EngineError::from)?;

        Ok(self.engine.resume(thread_id).await?)
    }

    /// Record a user clarification and resume at SQL generation.
    pub async fn clarify(
        &self,
        thread_id: &str,
        clarification: &str,
    ) -> Result<RunOutcome, ApprovalError> {
        if clarification.trim().is_empty() {
            return Err(ApprovalError::EmptyClarification);
        }
        let checkpointer = self.engine.checkpointer();
        let checkpoint = checkpointer
            .load_latest(thread_id)
            .await
            .map_err(EngineError::from)?
            .ok_or_else(|| EngineError::UnknownThread(thread_id.to_string()))?;

        let mut state = checkpoint.state.clone();
        state.push_clarification(clarification);
        state.clarification_message = None;

        checkpointer
            .save(Checkpoint::new(
                thread_id,
                checkpoint.step,
                Some(NodeKind::GenerateSql),
                state,
            ))
            .await
            .map_err(EngineError::from)?;

        Ok(self.engine.resume(thread_id).await?)
    }

    /// Current status of a thread, without driving it.
    pub async fn status(&self, thread_id: &str) -> Result<RunStatus, ApprovalError> {
        Ok(self.engine.inspect(thread_id).await?.status)
    }
}
