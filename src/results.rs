//! Result store: caches execution results and builds transport payloads
//! with reference indirection for large outputs.
//!
//! Cache layout (all through the KV adapter):
//! - `qresult:{hash}`      → full [`ExecutionResult`], keyed by normalized
//!   SQL + backend hash so identical queries share one entry;
//! - `qref:{query_id}`     → `{query_hash}` registration;
//! - `qresultById:{query_id}` → full result, direct fallback path.
//!
//! Transport payloads above the streaming threshold carry a 50-row preview
//! plus a [`ResultReference`]; the full rows stay fetchable by `query_id`.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::kv::KvStore;
use crate::sql::query_hash;
use crate::state::ExecutionResult;
use crate::types::DatabaseType;

/// Compact handle returned in lieu of inlining large result rows.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ResultReference {
    pub query_id: String,
    pub row_count: usize,
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_status: Option<String>,
}

/// Transport payload: either the full result inline or a bounded preview
/// plus a reference.
#[derive(Clone, Debug)]
pub struct TransportPayload {
    pub results: ExecutionResult,
    pub result_ref: Option<ResultReference>,
    pub truncated: bool,
}

/// Sizing thresholds for transport payloads.
#[derive(Clone, Copy, Debug)]
pub struct StreamLimits {
    pub max_rows: usize,
    pub preview_rows: usize,
}

impl Default for StreamLimits {
    fn default() -> Self {
        Self {
            max_rows: 200,
            preview_rows: 50,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct RefRecord {
    query_hash: String,
}

/// Cache + reference indirection for execution results.
pub struct ResultStore {
    kv: Arc<dyn KvStore>,
    limits: StreamLimits,
    small_ttl: Duration,
    large_ttl: Duration,
}

impl ResultStore {
    #[must_use]
    pub fn new(
        kv: Arc<dyn KvStore>,
        limits: StreamLimits,
        small_ttl: Duration,
        large_ttl: Duration,
    ) -> Self {
        Self {
            kv,
            limits,
            small_ttl,
            large_ttl,
        }
    }

    #[must_use]
    pub fn limits(&self) -> StreamLimits {
        self.limits
    }

    /// Cache a result under its query hash and register the
    /// `query_id → hash` reference. Returns the hash.
    pub async fn store(
        &self,
        query_id: &str,
        sql: &str,
        database: DatabaseType,
        result: &ExecutionResult,
    ) -> String {
        let hash = query_hash(sql, database);
        let ttl = if result.row_count > self.limits.max_rows {
            self.large_ttl
        } else {
            self.small_ttl
        };
        if let Ok(encoded) = serde_json::to_string(result) {
            let _ = self
                .kv
                .set(&format!("qresult:{hash}"), encoded.clone(), Some(ttl))
                .await;
            let _ = self
                .kv
                .set(
                    &format!("qresultById:{query_id}"),
                    encoded,
                    Some(self.large_ttl),
                )
                .await;
        }
        if let Ok(reference) = serde_json::to_string(&RefRecord {
            query_hash: hash.clone(),
        }) {
            let _ = self
                .kv
                .set(&format!("qref:{query_id}"), reference, Some(self.large_ttl))
                .await;
        }
        hash
    }

    /// Cached result for a normalized SQL + backend pair, if present.
    pub async fn fetch_by_sql(
        &self,
        sql: &str,
        database: DatabaseType,
    ) -> Option<ExecutionResult> {
        let hash = query_hash(sql, database);
        self.fetch_raw(&format!("qresult:{hash}")).await
    }

    /// Fetch a result by `query_id`: reference path first, direct entry as
    /// fallback.
    pub async fn fetch_by_query_id(&self, query_id: &str) -> Option<ExecutionResult> {
        if let Some(raw) = self.kv.get(&format!("qref:{query_id}")).await.ok().flatten() {
            if let Ok(record) = serde_json::from_str::<RefRecord>(&raw) {
                if let Some(result) = self
                    .fetch_raw(&format!("qresult:{}", record.query_hash))
                    .await
                {
                    return Some(result);
                }
            }
        }
        self.fetch_raw(&format!("qresultById:{query_id}")).await
    }

    /// Build the transport payload for a result.
    ///
    /// Results above `max_rows` (by declared count or actual rows) are cut
    /// to `preview_rows` with a reference attached; anything else goes out
    /// inline untouched.
    #[must_use]
    pub fn transport_payload(
        &self,
        query_id: &str,
        result: &ExecutionResult,
        cache_status: Option<&str>,
    ) -> TransportPayload {
        let oversize = result.row_count > self.limits.max_rows
            || result.rows.len() > self.limits.max_rows;
        if !oversize {
            return TransportPayload {
                results: result.clone(),
                result_ref: None,
                truncated: false,
            };
        }
        let mut preview = result.clone();
        preview.rows.truncate(self.limits.preview_rows);
        preview.truncated = true;
        TransportPayload {
            results: preview,
            result_ref: Some(ResultReference {
                query_id: query_id.to_string(),
                row_count: result.row_count,
                columns: result.columns.clone(),
                cache_status: cache_status.map(str::to_string),
            }),
            truncated: true,
        }
    }

    async fn fetch_raw(&self, key: &str) -> Option<ExecutionResult> {
        let raw = self.kv.get(key).await.ok()??;
        serde_json::from_str(&raw).ok()
    }
}
