//! Sqlite-backed checkpointer.
//!
//! One logical table keyed by `thread_id`: every node boundary appends a
//! row with the serialized [`QueryState`], the step counter, and the next
//! node to enter. `load_latest` reads the highest step; retention pruning
//! enforces both an age cutoff and a per-thread history cap.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;
use tracing::instrument;

use super::checkpoint::{Checkpoint, Checkpointer, CheckpointerError, Result};
use crate::types::NodeKind;

pub struct SqliteCheckpointer {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteCheckpointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteCheckpointer").finish()
    }
}

fn backend_err(e: sqlx::Error) -> CheckpointerError {
    CheckpointerError::Backend {
        message: e.to_string(),
    }
}

fn serde_err(e: serde_json::Error) -> CheckpointerError {
    CheckpointerError::Serde {
        message: e.to_string(),
    }
}

impl SqliteCheckpointer {
    /// Connect (or create) the checkpoint database at `database_url`,
    /// e.g. `sqlite://amila.db`.
    #[instrument(skip(database_url))]
    pub async fn connect(database_url: &str) -> Result<Self> {
        // Ensure the underlying file exists before sqlx opens it.
        if let Some(path) = database_url.strip_prefix("sqlite://") {
            let path = path.trim();
            if !path.is_empty() && path != ":memory:" {
                let p = std::path::Path::new(path);
                if let Some(parent) = p.parent() {
                    let _ = std::fs::create_dir_all(parent);
                }
                if !p.exists() {
                    let _ = std::fs::File::create_new(p);
                }
            }
        }
        let pool = SqlitePool::connect(database_url).await.map_err(backend_err)?;
        sqlx::query(
            r"CREATE TABLE IF NOT EXISTS checkpoints (
                thread_id   TEXT    NOT NULL,
                step        INTEGER NOT NULL,
                query_id    TEXT    NOT NULL,
                next_node   TEXT,
                state_json  TEXT    NOT NULL,
                created_at  TEXT    NOT NULL,
                PRIMARY KEY (thread_id, step)
            )",
        )
        .execute(&pool)
        .await
        .map_err(backend_err)?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_checkpoints_created_at ON checkpoints (created_at)",
        )
        .execute(&pool)
        .await
        .map_err(backend_err)?;
        Ok(Self { pool })
    }

    fn row_to_checkpoint(row: &sqlx::sqlite::SqliteRow) -> Result<Checkpoint> {
        let state_json: String = row.try_get("state_json").map_err(backend_err)?;
        let state = serde_json::from_str(&state_json).map_err(serde_err)?;
        let next_node: Option<String> = row.try_get("next_node").map_err(backend_err)?;
        let created_at: String = row.try_get("created_at").map_err(backend_err)?;
        Ok(Checkpoint {
            thread_id: row.try_get("thread_id").map_err(backend_err)?,
            query_id: row.try_get("query_id").map_err(backend_err)?,
            step: row.try_get::<i64, _>("step").map_err(backend_err)? as u64,
            next_node: next_node.as_deref().and_then(NodeKind::decode),
            state,
            created_at: created_at
                .parse::<DateTime<Utc>>()
                .unwrap_or_else(|_| Utc::now()),
        })
    }
}

#[async_trait]
impl Checkpointer for SqliteCheckpointer {
    #[instrument(skip(self, checkpoint), fields(thread_id = %checkpoint.thread_id, step = checkpoint.step))]
    async fn save(&self, checkpoint: Checkpoint) -> Result<()> {
        let state_json = serde_json::to_string(&checkpoint.state).map_err(serde_err)?;
        sqlx::query(
            r"INSERT INTO checkpoints (thread_id, step, query_id, next_node, state_json, created_at)
              VALUES (?1, ?2, ?3, ?4, ?5, ?6)
              ON CONFLICT (thread_id, step) DO UPDATE SET
                query_id = excluded.query_id,
                next_node = excluded.next_node,
                state_json = excluded.state_json,
                created_at = excluded.created_at",
        )
        .bind(&checkpoint.thread_id)
        .bind(checkpoint.step as i64)
        .bind(&checkpoint.query_id)
        .bind(checkpoint.next_node.map(|n| n.encode().to_string()))
        .bind(state_json)
        .bind(checkpoint.created_at.to_rfc3339())
        .execute(&self.pool)
        .await
        .map_err(backend_err)?;
        Ok(())
    }

    async fn load_latest(&self, thread_id: &str) -> Result<Option<Checkpoint>> {
        let row = sqlx::query(
            r"SELECT thread_id, step, query_id, next_node, state_json, created_at
              FROM checkpoints WHERE thread_id = ?1
              ORDER BY step DESC LIMIT 1",
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend_err)?;
        row.as_ref().map(Self::row_to_checkpoint).transpose()
    }

    async fn list_threads(&self) -> Result<Vec<String>> {
        let rows = sqlx::query("SELECT DISTINCT thread_id FROM checkpoints ORDER BY thread_id")
            .fetch_all(&self.pool)
            .await
            .map_err(backend_err)?;
        rows.iter()
            .map(|r| r.try_get::<String, _>("thread_id").map_err(backend_err))
            .collect()
    }

    async fn delete_thread(&self, thread_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM checkpoints WHERE thread_id = ?1")
            .bind(thread_id)
            .execute(&self.pool)
            .await
            .map_err(backend_err)?;
        Ok(())
    }

    #[instrument(skip(self))]
    async fn prune(&self, cutoff: DateTime<Utc>, max_per_thread: usize) -> Result<u64> {
        let aged = sqlx::query("DELETE FROM checkpoints WHERE created_at < ?1")
            .bind(cutoff.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(backend_err)?
            .rows_affected();
        // Cap per-thread history, keeping the newest steps.
        let capped = sqlx::query(
            r"DELETE FROM checkpoints
              WHERE (thread_id, step) NOT IN (
                SELECT thread_id, step FROM checkpoints AS c
                WHERE (
                  SELECT COUNT(*) FROM checkpoints AS newer
                  WHERE newer.thread_id = c.thread_id AND newer.step >= c.step
                ) <= ?1
              )",
        )
        .bind(max_per_thread as i64)
        .execute(&self.pool)
        .await
        .map_err(backend_err)?
        .rows_affected();
        Ok(aged + capped)
    }
}
