//! Shared fixtures for integration tests: a scripted language model, a
//! scripted database adapter, and a fast-tuned application context.

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use amila::bootstrap::{AppContext, AppContextBuilder};
use amila::config::Settings;
use amila::db::{DatabaseAdapter, DbError, RouterConfig, SchemaColumn, SchemaData};
use amila::lifecycle::{LifecycleEvent, Subscription};
use amila::llm::{CompletionRequest, CompletionResponse, LanguageModel, LlmError, TokenUsage};
use amila::resilience::BackoffPolicy;
use amila::state::ExecutionResult;
use amila::types::DatabaseType;
use amila::webhooks::WebhookConfig;

/// Default SQL the scripted model produces; `FETCH FIRST` keeps the probe
/// step out of the way.
pub const DEFAULT_SQL: &str = "SELECT ID, NAME FROM CUSTOMER_DATA FETCH FIRST 5 ROWS ONLY";

/// Language model whose answers are scripted per call site.
///
/// `sql_responses` feeds `generate_sql` (raw envelope JSON or bare SQL);
/// `rewrite_responses` feeds repair/fallback/sub-query generation. Empty
/// queues fall back to a high-confidence envelope around [`DEFAULT_SQL`].
pub struct ScriptedLlm {
    sql_responses: Mutex<VecDeque<String>>,
    rewrite_responses: Mutex<VecDeque<String>>,
    fallback_failures: Mutex<u32>,
}

impl ScriptedLlm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sql_responses: Mutex::new(VecDeque::new()),
            rewrite_responses: Mutex::new(VecDeque::new()),
            fallback_failures: Mutex::new(0),
        })
    }

    pub fn push_sql_response(&self, response: impl Into<String>) {
        self.sql_responses.lock().push_back(response.into());
    }

    pub fn push_rewrite(&self, sql: impl Into<String>) {
        self.rewrite_responses.lock().push_back(sql.into());
    }

    /// Make the next `n` fallback-generation calls fail with a provider
    /// error (retryable by the engine).
    pub fn fail_next_fallbacks(&self, n: u32) {
        *self.fallback_failures.lock() += n;
    }

    pub fn envelope(sql: &str, confidence: u8) -> String {
        json!({"sql": sql, "confidence": confidence}).to_string()
    }

    pub fn clarification_envelope(message: &str) -> String {
        json!({
            "sql": "",
            "confidence": 10,
            "clarification_needed": true,
            "clarification_message": message,
        })
        .to_string()
    }
}

#[async_trait]
impl LanguageModel for ScriptedLlm {
    fn provider(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let system = request.system.as_str();
        let content = if system.contains("classify analytics questions") {
            json!({"intent": "read"}).to_string()
        } else if system.contains("plan SQL queries") {
            "Read a small sample from the customer table.".to_string()
        } else if system.contains("You write production SQL") {
            self.sql_responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| Self::envelope(DEFAULT_SQL, 90))
        } else if system.contains("You are a SQL expert") {
            // Fallback generation.
            {
                let mut failures = self.fallback_failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(LlmError::Provider {
                        provider: "openai".to_string(),
                        message: "scripted fallback failure".to_string(),
                    });
                }
            }
            self.rewrite_responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| DEFAULT_SQL.to_string())
        } else if system.contains("Return only the final SQL") {
            // Repair.
            self.rewrite_responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| DEFAULT_SQL.to_string())
        } else if system.contains("troubleshooting") {
            "Broaden the filters and aggregate by month instead.".to_string()
        } else {
            "ok".to_string()
        };
        Ok(CompletionResponse {
            content,
            usage: TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 20,
            },
        })
    }
}

/// Database adapter whose execute results are scripted.
pub struct ScriptedAdapter {
    database: DatabaseType,
    executions: Mutex<VecDeque<Result<ExecutionResult, DbError>>>,
    pub executed_sql: Mutex<Vec<String>>,
}

impl ScriptedAdapter {
    pub fn new(database: DatabaseType) -> Arc<Self> {
        Arc::new(Self {
            database,
            executions: Mutex::new(VecDeque::new()),
            executed_sql: Mutex::new(Vec::new()),
        })
    }

    pub fn push_execution(&self, result: Result<ExecutionResult, DbError>) {
        self.executions.lock().push_back(result);
    }

    pub fn execution_count(&self) -> usize {
        self.executed_sql.lock().len()
    }
}

pub fn sample_schema() -> SchemaData {
    let mut schema = SchemaData::default();
    schema.tables.insert(
        "CUSTOMER_DATA".to_string(),
        vec![
            SchemaColumn {
                name: "ID".to_string(),
                type_name: "NUMBER".to_string(),
                nullable: false,
            },
            SchemaColumn {
                name: "NAME".to_string(),
                type_name: "VARCHAR2".to_string(),
                nullable: true,
            },
        ],
    );
    schema
}

pub fn sample_result() -> ExecutionResult {
    ExecutionResult::new(
        vec!["ID".to_string(), "NAME".to_string()],
        vec![
            vec![json!(1), json!("ACME")],
            vec![json!(2), json!("GLOBEX")],
            vec![json!(3), json!("INITECH")],
        ],
        7,
    )
}

pub fn empty_result() -> ExecutionResult {
    ExecutionResult::new(vec!["ID".to_string(), "NAME".to_string()], vec![], 4)
}

pub fn wide_result(rows: usize) -> ExecutionResult {
    let rows: Vec<Vec<serde_json::Value>> = (0..rows)
        .map(|i| vec![json!(i), json!(format!("name-{i}"))])
        .collect();
    ExecutionResult::new(vec!["ID".to_string(), "NAME".to_string()], rows, 11)
}

#[async_trait]
impl DatabaseAdapter for ScriptedAdapter {
    fn database_type(&self) -> DatabaseType {
        self.database
    }

    async fn get_schema(
        &self,
        _user_query: &str,
        _connection: Option<&str>,
    ) -> Result<SchemaData, DbError> {
        Ok(sample_schema())
    }

    async fn execute(
        &self,
        sql: &str,
        _connection: Option<&str>,
        _user: Option<&str>,
    ) -> Result<ExecutionResult, DbError> {
        self.executed_sql.lock().push(sql.to_string());
        self.executions
            .lock()
            .pop_front()
            .unwrap_or_else(|| Ok(sample_result()))
    }
}

/// Build a fast-tuned context around the given model and adapter.
pub fn test_context(llm: Arc<ScriptedLlm>, adapter: Arc<ScriptedAdapter>) -> AppContext {
    let settings = Settings::default();
    AppContextBuilder::new(settings)
        .with_language_model(llm)
        .with_adapter(adapter)
        .with_node_backoff(BackoffPolicy {
            base: Duration::from_millis(1),
            cap: Duration::from_millis(5),
            max_retries: 2,
        })
        .with_router_config(RouterConfig {
            execution_deadline: Duration::from_secs(5),
            backoff: BackoffPolicy {
                base: Duration::from_millis(1),
                cap: Duration::from_millis(5),
                max_retries: 2,
            },
        })
        .with_webhook_config(WebhookConfig {
            max_attempts: 2,
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(50),
            request_timeout: Duration::from_secs(2),
            default_secret: "test-webhook-secret".to_string(),
        })
        .build()
        .expect("context builds")
}

/// Drain a lifecycle subscription until a terminal event or timeout,
/// returning everything received (the replayed event included).
pub async fn collect_events(mut subscription: Subscription) -> Vec<LifecycleEvent> {
    let mut events = Vec::new();
    if let Some(last) = subscription.last_event.take() {
        let terminal = last.state.is_terminal();
        events.push(last);
        if terminal {
            return events;
        }
    }
    loop {
        match tokio::time::timeout(Duration::from_secs(2), subscription.receiver.recv()).await {
            Ok(Ok(event)) => {
                let terminal = event.state.is_terminal();
                events.push(event);
                if terminal {
                    return events;
                }
            }
            _ => return events,
        }
    }
}
