//! Process bootstrap: the explicit dependency container.
//!
//! Long-lived clients (KV store, checkpointer, breaker registry,
//! lifecycle bus, result store, database router, LLM client, webhook
//! dispatcher, engine) are constructed here in dependency order, handed
//! to each other through constructors, and torn down in reverse order on
//! shutdown. Nothing is reachable through globals.

use std::sync::Arc;
use std::time::Duration;

use crate::approval::ApprovalGate;
use crate::config::Settings;
use crate::db::{DatabaseAdapter, DatabaseRouter, RouterConfig};
use crate::engine::{Checkpointer, EngineError, InMemoryCheckpointer, Orchestrator};
use crate::http::{ApiState, TokenVerifier};
use crate::kv::{InMemoryKv, KvStore};
use crate::lifecycle::LifecycleBus;
use crate::llm::LanguageModel;
use crate::node::Services;
use crate::resilience::{BackoffPolicy, BreakerConfig, BreakerRegistry};
use crate::results::{ResultStore, StreamLimits};
use crate::webhooks::{SubscriptionStore, WebhookConfig, WebhookDispatcher};

#[derive(Debug, thiserror::Error, miette::Diagnostic)]
pub enum BootstrapError {
    #[error("no language model configured")]
    #[diagnostic(
        code(amila::bootstrap::missing_llm),
        help("Provide a LanguageModel implementation via with_language_model().")
    )]
    MissingLanguageModel,

    #[error(transparent)]
    #[diagnostic(code(amila::bootstrap::engine))]
    Engine(#[from] EngineError),
}

/// Fully wired application context.
pub struct AppContext {
    pub settings: Arc<Settings>,
    pub kv: Arc<dyn KvStore>,
    pub breakers: Arc<BreakerRegistry>,
    pub lifecycle: Arc<LifecycleBus>,
    pub results: Arc<ResultStore>,
    pub database: Arc<DatabaseRouter>,
    pub checkpointer: Arc<dyn Checkpointer>,
    pub subscriptions: Arc<SubscriptionStore>,
    pub dispatcher: Arc<WebhookDispatcher>,
    pub services: Arc<Services>,
    pub engine: Arc<Orchestrator>,
    pub gate: Arc<ApprovalGate>,
}

/// Builder assembling the container. The language model is the only
/// mandatory external; everything else has in-process defaults.
pub struct AppContextBuilder {
    settings: Arc<Settings>,
    llm: Option<Arc<dyn LanguageModel>>,
    kv: Option<Arc<dyn KvStore>>,
    checkpointer: Option<Arc<dyn Checkpointer>>,
    adapters: Vec<Arc<dyn DatabaseAdapter>>,
    node_backoff: Option<BackoffPolicy>,
    router_config: Option<RouterConfig>,
    webhook_config: Option<WebhookConfig>,
}

impl AppContextBuilder {
    #[must_use]
    pub fn new(settings: Settings) -> Self {
        Self {
            settings: Arc::new(settings),
            llm: None,
            kv: None,
            checkpointer: None,
            adapters: Vec::new(),
            node_backoff: None,
            router_config: None,
            webhook_config: None,
        }
    }

    #[must_use]
    pub fn with_language_model(mut self, llm: Arc<dyn LanguageModel>) -> Self {
        self.llm = Some(llm);
        self
    }

    #[must_use]
    pub fn with_kv(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    #[must_use]
    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = Some(checkpointer);
        self
    }

    #[must_use]
    pub fn with_adapter(mut self, adapter: Arc<dyn DatabaseAdapter>) -> Self {
        self.adapters.push(adapter);
        self
    }

    #[must_use]
    pub fn with_node_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.node_backoff = Some(backoff);
        self
    }

    #[must_use]
    pub fn with_router_config(mut self, config: RouterConfig) -> Self {
        self.router_config = Some(config);
        self
    }

    #[must_use]
    pub fn with_webhook_config(mut self, config: WebhookConfig) -> Self {
        self.webhook_config = Some(config);
        self
    }

    /// Wire everything together. Fails on a missing language model or on
    /// routing-table validation, both programming errors caught at startup.
    pub fn build(self) -> Result<AppContext, BootstrapError> {
        let settings = self.settings;
        let llm = self.llm.ok_or(BootstrapError::MissingLanguageModel)?;

        let breakers = Arc::new(BreakerRegistry::new(BreakerConfig {
            failure_threshold: settings.breaker_failure_threshold,
            recovery_timeout: settings.breaker_recovery_timeout,
            success_threshold: settings.breaker_success_threshold,
        }));

        let kv: Arc<dyn KvStore> = self.kv.unwrap_or_else(|| Arc::new(InMemoryKv::new()));
        let checkpointer: Arc<dyn Checkpointer> = self
            .checkpointer
            .unwrap_or_else(|| Arc::new(InMemoryCheckpointer::new()));

        let lifecycle = Arc::new(LifecycleBus::new(kv.clone(), settings.lifecycle_retention));
        let results = Arc::new(ResultStore::new(
            kv.clone(),
            StreamLimits {
                max_rows: settings.stream_max_rows,
                preview_rows: settings.stream_preview_rows,
            },
            settings.cache_default_ttl,
            settings.result_ref_ttl,
        ));

        let router_config = self.router_config.unwrap_or(RouterConfig {
            execution_deadline: settings.execution_deadline,
            backoff: BackoffPolicy::default(),
        });
        let mut database = DatabaseRouter::new(breakers.clone(), router_config);
        for adapter in self.adapters {
            database.register(adapter);
        }
        let database = Arc::new(database);

        let subscriptions = Arc::new(SubscriptionStore::new(kv.clone()));
        let webhook_config = self.webhook_config.unwrap_or_else(|| WebhookConfig {
            max_attempts: settings.webhook_max_attempts,
            backoff_base: settings.webhook_backoff_base,
            backoff_cap: settings.webhook_backoff_cap,
            request_timeout: settings.webhook_request_timeout,
            default_secret: settings.hmac_secret.clone(),
        });
        let dispatcher = WebhookDispatcher::new(subscriptions.clone(), webhook_config);

        let services = Arc::new(Services {
            settings: settings.clone(),
            llm,
            database: database.clone(),
            results: results.clone(),
            lifecycle: lifecycle.clone(),
            kv: kv.clone(),
        });

        let mut engine = Orchestrator::new(services.clone(), checkpointer.clone())?
            .with_webhooks(dispatcher.clone());
        if let Some(backoff) = self.node_backoff {
            engine = engine.with_node_backoff(backoff);
        }
        let engine = Arc::new(engine);
        let gate = Arc::new(ApprovalGate::new(engine.clone()));

        Ok(AppContext {
            settings,
            kv,
            breakers,
            lifecycle,
            results,
            database,
            checkpointer,
            subscriptions,
            dispatcher,
            services,
            engine,
            gate,
        })
    }
}

impl AppContext {
    /// API state for the HTTP router.
    #[must_use]
    pub fn api_state(&self, verifier: Arc<dyn TokenVerifier>, csrf_enforced: bool) -> ApiState {
        ApiState {
            engine: self.engine.clone(),
            gate: self.gate.clone(),
            services: self.services.clone(),
            subscriptions: self.subscriptions.clone(),
            dispatcher: self.dispatcher.clone(),
            verifier,
            breakers: self.breakers.clone(),
            csrf_enforced,
        }
    }

    /// Spawn periodic maintenance: checkpoint retention pruning and
    /// terminal lifecycle channel sweeping.
    #[must_use]
    pub fn spawn_maintenance(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let checkpointer = self.checkpointer.clone();
        let lifecycle = self.lifecycle.clone();
        let retention = self.settings.retention();
        let max_per_thread = self.settings.max_per_thread as usize;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let cutoff = chrono::Utc::now()
                    - chrono::Duration::from_std(retention).unwrap_or_default();
                match checkpointer.prune(cutoff, max_per_thread).await {
                    Ok(removed) if removed > 0 => {
                        tracing::info!(removed, "checkpoint retention pruned");
                    }
                    Ok(_) => {}
                    Err(err) => tracing::warn!(error = %err, "checkpoint pruning failed"),
                }
                lifecycle.sweep_terminal();
            }
        })
    }

    /// Tear the container down in reverse construction order. Pool-backed
    /// clients release their connections on drop; this makes the ordering
    /// explicit and observable.
    pub async fn shutdown(self, maintenance: Option<tokio::task::JoinHandle<()>>) {
        if let Some(handle) = maintenance {
            handle.abort();
        }
        tracing::info!("shutting down: engine");
        drop(self.gate);
        drop(self.engine);
        tracing::info!("shutting down: webhook dispatcher");
        drop(self.dispatcher);
        drop(self.subscriptions);
        tracing::info!("shutting down: database router and result store");
        drop(self.database);
        drop(self.results);
        tracing::info!("shutting down: lifecycle bus and checkpointer");
        self.lifecycle.sweep_terminal();
        drop(self.lifecycle);
        drop(self.checkpointer);
        drop(self.kv);
        tracing::info!("shutdown complete");
    }
}
