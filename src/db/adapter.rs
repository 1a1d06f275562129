//! Backend adapter seam for the database router.
//!
//! Each SQL backend implements [`DatabaseAdapter`] and owns its own error
//! normalization: whatever the driver raises is mapped into a [`DbError`]
//! with a typed [`DbErrorKind`] and a recoverability verdict before it
//! crosses into the orchestrator.

use async_trait::async_trait;
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use thiserror::Error;

use crate::resilience::Recoverable;
use crate::sql::build_probe_sql;
use crate::state::ExecutionResult;
use crate::types::DatabaseType;

/// Typed classification of a backend failure.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DbErrorKind {
    /// Transport-level failure; retried.
    Connection,
    /// Deadline expiry; retried.
    Timeout,
    /// Transient backend state (lock waits, failover); retried.
    Transient,
    /// SQL syntax rejected by the backend; routed to repair.
    Syntax,
    /// Referenced table or view does not exist; routed to repair.
    MissingObject,
    /// Unknown column or reserved-word identifier; routed to repair.
    InvalidIdentifier,
    /// Authentication/authorization failure.
    PermissionDenied,
    /// No adapter registered for the requested backend.
    Unsupported,
    /// Dependency breaker is open; fast-fail.
    CircuitOpen,
    /// Anything the adapter could not classify.
    Other,
}

/// Normalized backend error.
#[derive(Clone, Debug, Error, Diagnostic, Serialize, Deserialize)]
#[error("{database} error ({kind:?}): {message}")]
#[diagnostic(code(amila::db::backend))]
pub struct DbError {
    pub kind: DbErrorKind,
    pub message: String,
    pub database: DatabaseType,
}

impl DbError {
    #[must_use]
    pub fn new(kind: DbErrorKind, database: DatabaseType, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            database,
        }
    }

    #[must_use]
    pub fn timeout(database: DatabaseType, deadline: Duration) -> Self {
        Self::new(
            DbErrorKind::Timeout,
            database,
            format!("execution timed out after {deadline:?}"),
        )
    }

    #[must_use]
    pub fn circuit_open(database: DatabaseType) -> Self {
        Self::new(
            DbErrorKind::CircuitOpen,
            database,
            "circuit breaker open for database backend",
        )
    }
}

impl Recoverable for DbError {
    fn is_recoverable(&self) -> bool {
        matches!(
            self.kind,
            DbErrorKind::Connection | DbErrorKind::Timeout | DbErrorKind::Transient
        )
    }
}

/// One column of a table or view.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaColumn {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
    pub nullable: bool,
}

/// Schema metadata in the canonical transport shape:
/// `{tables: {name: [column]}, views: {name: [column]}}`.
#[derive(Clone, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct SchemaData {
    #[serde(default)]
    pub tables: BTreeMap<String, Vec<SchemaColumn>>,
    #[serde(default)]
    pub views: BTreeMap<String, Vec<SchemaColumn>>,
}

impl SchemaData {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty() && self.views.is_empty()
    }
}

/// Uniform backend interface the router dispatches to.
///
/// Implementations normalize their driver errors into [`DbError`] and are
/// free to truncate oversized result sets as long as they set
/// `ExecutionResult::truncated`.
#[async_trait]
pub trait DatabaseAdapter: Send + Sync {
    fn database_type(&self) -> DatabaseType;

    /// Schema metadata relevant to `user_query` (or the full schema when
    /// the backend has no relevance filtering).
    async fn get_schema(
        &self,
        user_query: &str,
        connection: Option<&str>,
    ) -> Result<SchemaData, DbError>;

    /// Execute SQL and return canonical rows.
    async fn execute(
        &self,
        sql: &str,
        connection: Option<&str>,
        user: Option<&str>,
    ) -> Result<ExecutionResult, DbError>;

    /// Structural dry-run: validate the statement shape without fetching
    /// rows. Default wraps the query in a zero-row aggregate.
    async fn probe(&self, sql: &str, connection: Option<&str>) -> Result<(), DbError> {
        self.execute(&build_probe_sql(sql), connection, None)
            .await
            .map(|_| ())
    }
}
