//! Postgres adapter over `sqlx`.
//!
//! The one backend this service can reach natively. Schema metadata comes
//! from `information_schema.columns`; arbitrary query rows are decoded into
//! JSON values by column type name, falling back to text and finally null
//! for exotic types.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPool, PgRow};
use sqlx::{Column, Row, TypeInfo};
use std::collections::BTreeMap;
use std::time::Instant;

use super::adapter::{DatabaseAdapter, DbError, DbErrorKind, SchemaColumn, SchemaData};
use crate::state::ExecutionResult;
use crate::types::DatabaseType;

/// Rows beyond this are cut at the adapter boundary and the result marked
/// truncated.
const MAX_FETCH_ROWS: usize = 10_000;

pub struct PostgresAdapter {
    pool: PgPool,
}

impl PostgresAdapter {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn connect(url: &str) -> Result<Self, DbError> {
        let pool = PgPool::connect(url)
            .await
            .map_err(|e| classify_sqlx_error(&e))?;
        Ok(Self::new(pool))
    }
}

#[async_trait]
impl DatabaseAdapter for PostgresAdapter {
    fn database_type(&self) -> DatabaseType {
        DatabaseType::Postgres
    }

    async fn get_schema(
        &self,
        _user_query: &str,
        _connection: Option<&str>,
    ) -> Result<SchemaData, DbError> {
        let rows = sqlx::query(
            r"SELECT table_name, column_name, data_type, is_nullable
              FROM information_schema.columns
              WHERE table_schema = 'public'
              ORDER BY table_name, ordinal_position",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| classify_sqlx_error(&e))?;

        let mut tables: BTreeMap<String, Vec<SchemaColumn>> = BTreeMap::new();
        for row in rows {
            let table: String = row.try_get("table_name").unwrap_or_default();
            let column: String = row.try_get("column_name").unwrap_or_default();
            let data_type: String = row.try_get("data_type").unwrap_or_default();
            let nullable: String = row.try_get("is_nullable").unwrap_or_default();
            tables.entry(table).or_default().push(SchemaColumn {
                name: column,
                type_name: data_type,
                nullable: nullable.eq_ignore_ascii_case("yes"),
            });
        }
        Ok(SchemaData {
            tables,
            views: BTreeMap::new(),
        })
    }

    async fn execute(
        &self,
        sql: &str,
        _connection: Option<&str>,
        _user: Option<&str>,
    ) -> Result<ExecutionResult, DbError> {
        let started = Instant::now();
        let rows = sqlx::query(sql)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| classify_sqlx_error(&e))?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let columns: Vec<String> = rows
            .first()
            .map(|row| row.columns().iter().map(|c| c.name().to_string()).collect())
            .unwrap_or_default();

        let total = rows.len();
        let truncated = total > MAX_FETCH_ROWS;
        let decoded: Vec<Vec<Value>> = rows
            .iter()
            .take(MAX_FETCH_ROWS)
            .map(decode_row)
            .collect();

        let mut result = ExecutionResult::new(columns, decoded, elapsed_ms);
        if truncated {
            result.row_count = total;
            result.truncated = true;
        }
        Ok(result)
    }
}

fn decode_row(row: &PgRow) -> Vec<Value> {
    row.columns()
        .iter()
        .enumerate()
        .map(|(idx, column)| decode_value(row, idx, column.type_info().name()))
        .collect()
}

fn decode_value(row: &PgRow, idx: usize, type_name: &str) -> Value {
    match type_name {
        "INT2" => row
            .try_get::<Option<i16>, _>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, |v| Value::from(v)),
        "INT4" => row
            .try_get::<Option<i32>, _>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::from),
        "INT8" => row
            .try_get::<Option<i64>, _>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::from),
        "FLOAT4" => row
            .try_get::<Option<f32>, _>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, |v| Value::from(f64::from(v))),
        "FLOAT8" => row
            .try_get::<Option<f64>, _>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::from),
        "BOOL" => row
            .try_get::<Option<bool>, _>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::from),
        "DATE" => row
            .try_get::<Option<NaiveDate>, _>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, |v| Value::from(v.to_string())),
        "TIMESTAMP" => row
            .try_get::<Option<NaiveDateTime>, _>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, |v| Value::from(v.to_string())),
        "TIMESTAMPTZ" => row
            .try_get::<Option<DateTime<Utc>>, _>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, |v| Value::from(v.to_rfc3339())),
        "JSON" | "JSONB" => row
            .try_get::<Option<Value>, _>(idx)
            .ok()
            .flatten()
            .unwrap_or(Value::Null),
        "UUID" => row
            .try_get::<Option<uuid::Uuid>, _>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, |v| Value::from(v.to_string())),
        _ => row
            .try_get::<Option<String>, _>(idx)
            .ok()
            .flatten()
            .map_or(Value::Null, Value::from),
    }
}

/// Map a `sqlx` error into the shared classification via SQLSTATE.
pub fn classify_sqlx_error(error: &sqlx::Error) -> DbError {
    let kind = match error {
        sqlx::Error::PoolTimedOut => DbErrorKind::Timeout,
        sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::Configuration(_) => {
            DbErrorKind::Connection
        }
        sqlx::Error::Database(db) => match db.code().as_deref() {
            Some("42601") => DbErrorKind::Syntax,
            Some("42P01") => DbErrorKind::MissingObject,
            Some("42703") => DbErrorKind::InvalidIdentifier,
            Some("42501" | "28000" | "28P01") => DbErrorKind::PermissionDenied,
            Some("40001" | "40P01" | "55P03") => DbErrorKind::Transient,
            Some("57014") => DbErrorKind::Timeout,
            _ => DbErrorKind::Other,
        },
        _ => DbErrorKind::Other,
    };
    DbError::new(kind, DatabaseType::Postgres, error.to_string())
}
