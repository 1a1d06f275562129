//! Checkpoint infrastructure.
//!
//! A [`Checkpoint`] is a durable snapshot of one query's [`QueryState`]
//! taken at a node boundary, keyed by `thread_id`. The engine saves one
//! after every node; resumption loads the latest and re-enters at the
//! recorded next node.
//!
//! [`InMemoryCheckpointer`] keeps bounded per-thread history and is used
//! by tests and ephemeral runs; the sqlite implementation lives in
//! [`checkpoint_sqlite`](crate::engine::checkpoint_sqlite).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Diagnostic;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::state::QueryState;
use crate::types::NodeKind;

/// A durable snapshot of query execution at a node boundary.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Checkpoint {
    pub thread_id: String,
    pub query_id: String,
    /// Monotonic per-thread step counter.
    pub step: u64,
    /// Node to enter on resumption; `None` once the query is terminal.
    pub next_node: Option<NodeKind>,
    pub state: QueryState,
    pub created_at: DateTime<Utc>,
}

impl Checkpoint {
    #[must_use]
    pub fn new(thread_id: &str, step: u64, next_node: Option<NodeKind>, state: QueryState) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            query_id: state.query_id.clone(),
            step,
            next_node,
            state,
            created_at: Utc::now(),
        }
    }
}

/// Errors from checkpointer operations.
#[derive(Debug, Error, Diagnostic)]
pub enum CheckpointerError {
    #[error("thread not found: {thread_id}")]
    #[diagnostic(code(amila::checkpointer::not_found))]
    NotFound { thread_id: String },

    #[error("checkpoint backend error: {message}")]
    #[diagnostic(
        code(amila::checkpointer::backend),
        help("Check backend connectivity and permissions; backend message: {message}.")
    )]
    Backend { message: String },

    #[error("checkpoint serialization error: {message}")]
    #[diagnostic(code(amila::checkpointer::serde))]
    Serde { message: String },
}

pub type Result<T> = std::result::Result<T, CheckpointerError>;

/// Durable storage for query execution state.
///
/// Implementations must keep `save` idempotent per `(thread_id, step)` and
/// `load_latest` consistent with the most recent save.
#[async_trait]
pub trait Checkpointer: Send + Sync {
    /// Persist a checkpoint (append to the thread's history).
    async fn save(&self, checkpoint: Checkpoint) -> Result<()>;

    /// Load the most recent checkpoint for a thread, if any.
    async fn load_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>>;

    /// All thread ids with at least one checkpoint.
    async fn list_threads(&self) -> Result<Vec<String>>;

    /// Drop a thread's checkpoints entirely.
    async fn delete_thread(&self, thread_id: &str) -> Result<()>;

    /// Apply retention: delete checkpoints older than `cutoff` and cap
    /// per-thread history at `max_per_thread` (newest kept). Returns the
    /// number of checkpoints removed.
    async fn prune(&self, cutoff: DateTime<Utc>, max_per_thread: usize) -> Result<u64>;
}

/// Volatile checkpointer with bounded per-thread history.
#[derive(Default)]
pub struct InMemoryCheckpointer {
    inner: RwLock<FxHashMap<String, Vec<Checkpoint>>>,
}

impl InMemoryCheckpointer {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Checkpointer for InMemoryCheckpointer {
    async fn save(&self, checkpoint: Checkpoint) -> Result<()> {
        let mut map = self.inner.write();
        let history = map.entry(checkpoint.thread_id.clone()).or_default();
        // Same-step saves replace (idempotent re-checkpoint after resume).
        history.retain(|c| c.step != checkpoint.step);
        history.push(checkpoint);
        history.sort_by_key(|c| c.step);
        Ok(())
    }

    async fn load_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .inner
            .read()
            .get(thread_id)
            .and_then(|h| h.last().cloned()))
    }

    async fn list_threads(&self) -> Result<Vec<String>> {
        Ok(self.inner.read().keys().cloned().collect())
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        self.inner.write().remove(thread_id);
        Ok(())
    }

    async fn prune(&self, cutoff: DateTime<Utc>, max_per_thread: usize) -> Result<u64> {
        let mut removed = 0u64;
        let mut map = self.inner.write();
        map.retain(|_, history| {
            let before = history.len();
            history.retain(|c| c.created_at >= cutoff);
            if history.len() > max_per_thread {
                let excess = history.len() - max_per_thread;
                history.drain(..excess);
            }
            removed += (before - history.len()) as u64;
            !history.is_empty()
        });
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DatabaseType;

    fn checkpoint(thread: &str, step: u64) -> Checkpoint {
        let state = QueryState::new("q1", thread, "hello", DatabaseType::Oracle);
        Checkpoint::new(thread, step, Some(NodeKind::Understand), state)
    }

    #[tokio::test]
    async fn latest_wins() {
        let cp = InMemoryCheckpointer::new();
        cp.save(checkpoint("t1", 1)).await.unwrap();
        cp.save(checkpoint("t1", 3)).await.unwrap();
        cp.save(checkpoint("t1", 2)).await.unwrap();
        let latest = cp.load_latest("t1").await.unwrap().unwrap();
        assert_eq!(latest.step, 3);
    }

    #[tokio::test]
    async fn same_step_save_is_idempotent() {
        let cp = InMemoryCheckpointer::new();
        cp.save(checkpoint("t1", 1)).await.unwrap();
        cp.save(checkpoint("t1", 1)).await.unwrap();
        let threads = cp.list_threads().await.unwrap();
        assert_eq!(threads, vec!["t1".to_string()]);
        let latest = cp.load_latest("t1").await.unwrap().unwrap();
        assert_eq!(latest.step, 1);
    }

    #[tokio::test]
    async fn prune_caps_history() {
        let cp = InMemoryCheckpointer::new();
        for step in 0..20 {
            cp.save(checkpoint("t1", step)).await.unwrap();
        }
        let removed = cp
            .prune(Utc::now() - chrono::Duration::days(7), 10)
            .await
            .unwrap();
        assert_eq!(removed, 10);
        let latest = cp.load_latest("t1").await.unwrap().unwrap();
        assert_eq!(latest.step, 19);
    }
}
