//! Database router: dispatches schema and execution requests to the
//! backend adapter for the query's `database_type`, always through the
//! resilience layer (circuit breaker, classified retries, deadline).

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use super::adapter::{DatabaseAdapter, DbError, DbErrorKind, SchemaData};
use super::oracle;
use crate::resilience::{BackoffPolicy, BreakerRegistry, retry_with_backoff};
use crate::state::ExecutionResult;
use crate::types::DatabaseType;

/// Canonical execution report returned on the direct-SQL surface.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ExecutionReport {
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub results: Option<ExecutionResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oracle_detail: Option<oracle::OracleErrorInfo>,
    pub query_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub database_type: DatabaseType,
}

/// Router configuration; defaults follow the service settings.
#[derive(Clone, Copy, Debug)]
pub struct RouterConfig {
    /// Hard deadline per execution call.
    pub execution_deadline: Duration,
    /// Backoff for recoverable failures.
    pub backoff: BackoffPolicy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            execution_deadline: Duration::from_secs(600),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Dispatches to registered backend adapters.
pub struct DatabaseRouter {
    adapters: FxHashMap<DatabaseType, Arc<dyn DatabaseAdapter>>,
    breakers: Arc<BreakerRegistry>,
    config: RouterConfig,
}

impl DatabaseRouter {
    #[must_use]
    pub fn new(breakers: Arc<BreakerRegistry>, config: RouterConfig) -> Self {
        Self {
            adapters: FxHashMap::default(),
            breakers,
            config,
        }
    }

    /// Register a backend adapter. Later registrations for the same type
    /// replace earlier ones.
    pub fn register(&mut self, adapter: Arc<dyn DatabaseAdapter>) {
        self.adapters.insert(adapter.database_type(), adapter);
    }

    #[must_use]
    pub fn supports(&self, database: DatabaseType) -> bool {
        self.adapters.contains_key(&database)
    }

    fn adapter(&self, database: DatabaseType) -> Result<&Arc<dyn DatabaseAdapter>, DbError> {
        self.adapters.get(&database).ok_or_else(|| {
            DbError::new(
                DbErrorKind::Unsupported,
                database,
                format!("no adapter registered for {database}"),
            )
        })
    }

    /// Fetch schema metadata for `user_query`, breaker-gated with a short
    /// retry budget. Schema retrieval is non-fatal upstream, so failures
    /// surface as-is for the caller to degrade on.
    pub async fn get_schema(
        &self,
        database: DatabaseType,
        user_query: &str,
        connection: Option<&str>,
    ) -> Result<SchemaData, DbError> {
        let adapter = self.adapter(database)?.clone();
        let breaker = self.breakers.get(&format!("{database}_schema"));
        if !breaker.can_attempt() {
            return Err(DbError::circuit_open(database));
        }
        let policy = BackoffPolicy {
            max_retries: 1,
            ..self.config.backoff
        };
        let result = retry_with_backoff(policy, "get_schema", || {
            let adapter = adapter.clone();
            let user_query = user_query.to_string();
            let connection = connection.map(str::to_string);
            async move {
                adapter
                    .get_schema(&user_query, connection.as_deref())
                    .await
            }
        })
        .await;
        match &result {
            Ok(_) => breaker.record_success(),
            Err(_) => breaker.record_failure(),
        }
        result
    }

    /// Execute SQL through breaker + retry + deadline.
    ///
    /// Recoverable errors (connection, timeout, transient) are retried by
    /// the executor; whatever survives is returned classified so the
    /// orchestrator can route repair or fallback.
    pub async fn execute_sql(
        &self,
        database: DatabaseType,
        sql: &str,
        connection: Option<&str>,
        user: Option<&str>,
    ) -> Result<ExecutionResult, DbError> {
        let adapter = self.adapter(database)?.clone();
        let breaker = self.breakers.get(&format!("{database}_execution"));
        if !breaker.can_attempt() {
            return Err(DbError::circuit_open(database));
        }
        let deadline = self.config.execution_deadline;
        let result = retry_with_backoff(self.config.backoff, "execute_sql", || {
            let adapter = adapter.clone();
            let sql = sql.to_string();
            let connection = connection.map(str::to_string);
            let user = user.map(str::to_string);
            async move {
                match tokio::time::timeout(
                    deadline,
                    adapter.execute(&sql, connection.as_deref(), user.as_deref()),
                )
                .await
                {
                    Ok(inner) => inner,
                    Err(_) => Err(DbError::timeout(database, deadline)),
                }
            }
        })
        .await;
        match &result {
            Ok(_) => breaker.record_success(),
            Err(_) => breaker.record_failure(),
        }
        result
    }

    /// Structural dry-run through the adapter, breaker-gated, no retries.
    pub async fn probe_sql(
        &self,
        database: DatabaseType,
        sql: &str,
        connection: Option<&str>,
    ) -> Result<(), DbError> {
        let adapter = self.adapter(database)?.clone();
        let breaker = self.breakers.get(&format!("{database}_execution"));
        if !breaker.can_attempt() {
            return Err(DbError::circuit_open(database));
        }
        let result = adapter.probe(sql, connection).await;
        match &result {
            Ok(()) => breaker.record_success(),
            Err(_) => breaker.record_failure(),
        }
        result
    }

    /// Execute SQL and wrap the outcome in the canonical report shape used
    /// by the direct-SQL endpoint. Oracle errors carry their translated
    /// detail.
    pub async fn execute_to_report(
        &self,
        database: DatabaseType,
        sql: &str,
        connection: Option<&str>,
        user: Option<&str>,
        query_id: &str,
        trace_id: Option<&str>,
    ) -> ExecutionReport {
        match self.execute_sql(database, sql, connection, user).await {
            Ok(results) => ExecutionReport {
                status: "success".to_string(),
                results: Some(results),
                error: None,
                oracle_detail: None,
                query_id: query_id.to_string(),
                trace_id: trace_id.map(str::to_string),
                database_type: database,
            },
            Err(err) => {
                let oracle_detail = (database == DatabaseType::Oracle)
                    .then(|| oracle::parse_oracle_error(&err.message))
                    .filter(|info| info.error_code.is_some());
                ExecutionReport {
                    status: "error".to_string(),
                    results: None,
                    error: Some(err.message.clone()),
                    oracle_detail,
                    query_id: query_id.to_string(),
                    trace_id: trace_id.map(str::to_string),
                    database_type: database,
                }
            }
        }
    }
}
