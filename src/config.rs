//! Service configuration.
//!
//! Settings load once at bootstrap from the environment (`.env` honored via
//! `dotenvy`) into a typed struct that the dependency container hands to
//! every subsystem. Defaults match the documented operational values; an
//! unset variable never panics.

use rustc_hash::FxHashMap;
use std::time::Duration;

/// Typed configuration for the whole service.
#[derive(Clone, Debug)]
pub struct Settings {
    /// Bind address for the HTTP surface.
    pub listen_addr: String,

    /// Checkpoint retention in days.
    pub retention_days: u32,
    /// Checkpoints kept per thread before pruning.
    pub max_per_thread: u32,
    /// Sqlite URL for the checkpoint store.
    pub checkpoint_db_url: String,

    /// Default cache TTL for small results.
    pub cache_default_ttl: Duration,
    /// TTL for large results and result references.
    pub result_ref_ttl: Duration,
    /// Lifecycle last-event retention.
    pub lifecycle_retention: Duration,

    /// Circuit breaker defaults.
    pub breaker_failure_threshold: u32,
    pub breaker_recovery_timeout: Duration,
    pub breaker_success_threshold: u32,

    /// Transport sizing.
    pub stream_max_rows: usize,
    pub stream_preview_rows: usize,

    /// HITL policy: every query pauses for approval.
    pub require_approval_for_all: bool,

    /// Deadlines.
    pub execution_deadline: Duration,
    pub kv_deadline: Duration,
    pub llm_deadline: Duration,

    /// Per-provider token budgets for schema context.
    pub token_budgets: FxHashMap<String, usize>,

    /// Secret for request HMAC + CSRF signing and the default webhook
    /// secret when a subscription has none.
    pub hmac_secret: String,

    /// LLM endpoint configuration (OpenAI-compatible).
    pub llm_base_url: String,
    pub llm_api_key: String,
    pub llm_provider: String,
    pub llm_model: String,

    /// Optional Postgres adapter connection string.
    pub postgres_url: Option<String>,

    /// Webhook delivery tuning. `webhook_backoff_base` is scaled per
    /// attempt and capped at `webhook_backoff_cap`.
    pub webhook_max_attempts: u32,
    pub webhook_backoff_base: Duration,
    pub webhook_backoff_cap: Duration,
    pub webhook_request_timeout: Duration,
}

impl Default for Settings {
    fn default() -> Self {
        let mut token_budgets = FxHashMap::default();
        token_budgets.insert("openai".to_string(), 6_000);
        token_budgets.insert("anthropic".to_string(), 12_000);
        Self {
            listen_addr: "127.0.0.1:8000".to_string(),
            retention_days: 7,
            max_per_thread: 10,
            checkpoint_db_url: "sqlite://amila.db".to_string(),
            cache_default_ttl: Duration::from_secs(300),
            result_ref_ttl: Duration::from_secs(6 * 60 * 60),
            lifecycle_retention: Duration::from_secs(6 * 60 * 60),
            breaker_failure_threshold: 5,
            breaker_recovery_timeout: Duration::from_secs(60),
            breaker_success_threshold: 2,
            stream_max_rows: 200,
            stream_preview_rows: 50,
            require_approval_for_all: true,
            execution_deadline: Duration::from_secs(600),
            kv_deadline: Duration::from_secs(5),
            llm_deadline: Duration::from_secs(120),
            token_budgets,
            hmac_secret: "dev-secret-change-me".to_string(),
            llm_base_url: "http://127.0.0.1:4000/v1".to_string(),
            llm_api_key: String::new(),
            llm_provider: "openai".to_string(),
            llm_model: "gpt-4o-mini".to_string(),
            postgres_url: None,
            webhook_max_attempts: 10,
            webhook_backoff_base: Duration::from_secs(2),
            webhook_backoff_cap: Duration::from_secs(3600),
            webhook_request_timeout: Duration::from_secs(10),
        }
    }
}

impl Settings {
    /// Load settings from the environment, falling back to defaults.
    /// `.env` files are honored when present.
    #[must_use]
    pub fn from_env() -> Self {
        let _ = dotenvy::dotenv();
        let defaults = Self::default();
        let mut settings = Self {
            listen_addr: env_string("AMILA_LISTEN_ADDR", &defaults.listen_addr),
            retention_days: env_parse("AMILA_RETENTION_DAYS", defaults.retention_days),
            max_per_thread: env_parse("AMILA_MAX_PER_THREAD", defaults.max_per_thread),
            checkpoint_db_url: env_string("AMILA_CHECKPOINT_DB_URL", &defaults.checkpoint_db_url),
            cache_default_ttl: env_secs("AMILA_CACHE_TTL_SECS", defaults.cache_default_ttl),
            result_ref_ttl: env_secs("AMILA_RESULT_REF_TTL_SECS", defaults.result_ref_ttl),
            lifecycle_retention: env_secs(
                "AMILA_LIFECYCLE_RETENTION_SECS",
                defaults.lifecycle_retention,
            ),
            breaker_failure_threshold: env_parse(
                "AMILA_BREAKER_FAILURES",
                defaults.breaker_failure_threshold,
            ),
            breaker_recovery_timeout: env_secs(
                "AMILA_BREAKER_RECOVERY_SECS",
                defaults.breaker_recovery_timeout,
            ),
            breaker_success_threshold: env_parse(
                "AMILA_BREAKER_SUCCESSES",
                defaults.breaker_success_threshold,
            ),
            stream_max_rows: env_parse("AMILA_STREAM_MAX_ROWS", defaults.stream_max_rows),
            stream_preview_rows: env_parse(
                "AMILA_STREAM_PREVIEW_ROWS",
                defaults.stream_preview_rows,
            ),
            require_approval_for_all: env_parse(
                "AMILA_REQUIRE_APPROVAL",
                defaults.require_approval_for_all,
            ),
            execution_deadline: env_secs(
                "AMILA_EXECUTION_DEADLINE_SECS",
                defaults.execution_deadline,
            ),
            kv_deadline: env_secs("AMILA_KV_DEADLINE_SECS", defaults.kv_deadline),
            llm_deadline: env_secs("AMILA_LLM_DEADLINE_SECS", defaults.llm_deadline),
            token_budgets: defaults.token_budgets.clone(),
            hmac_secret: env_string("AMILA_HMAC_SECRET", &defaults.hmac_secret),
            llm_base_url: env_string("AMILA_LLM_BASE_URL", &defaults.llm_base_url),
            llm_api_key: env_string("AMILA_LLM_API_KEY", &defaults.llm_api_key),
            llm_provider: env_string("AMILA_LLM_PROVIDER", &defaults.llm_provider),
            llm_model: env_string("AMILA_LLM_MODEL", &defaults.llm_model),
            postgres_url: std::env::var("AMILA_POSTGRES_URL").ok(),
            webhook_max_attempts: env_parse(
                "AMILA_WEBHOOK_MAX_ATTEMPTS",
                defaults.webhook_max_attempts,
            ),
            webhook_backoff_base: env_secs(
                "AMILA_WEBHOOK_BACKOFF_BASE_SECS",
                defaults.webhook_backoff_base,
            ),
            webhook_backoff_cap: env_secs(
                "AMILA_WEBHOOK_BACKOFF_CAP_SECS",
                defaults.webhook_backoff_cap,
            ),
            webhook_request_timeout: env_secs(
                "AMILA_WEBHOOK_TIMEOUT_SECS",
                defaults.webhook_request_timeout,
            ),
        };
        // AMILA_TOKEN_BUDGETS="openai=6000,anthropic=12000"
        if let Ok(raw) = std::env::var("AMILA_TOKEN_BUDGETS") {
            for pair in raw.split(',') {
                if let Some((provider, budget)) = pair.split_once('=') {
                    if let Ok(budget) = budget.trim().parse::<usize>() {
                        settings
                            .token_budgets
                            .insert(provider.trim().to_string(), budget);
                    }
                }
            }
        }
        settings
    }

    /// Schema-context token budget for a provider (4k default).
    #[must_use]
    pub fn token_budget(&self, provider: &str) -> usize {
        self.token_budgets.get(provider).copied().unwrap_or(4_000)
    }

    /// Checkpoint retention as a duration.
    #[must_use]
    pub fn retention(&self) -> Duration {
        Duration::from_secs(u64::from(self.retention_days) * 24 * 60 * 60)
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_secs(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(default)
}
