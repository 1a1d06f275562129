//! Service binary: wire the container from the environment and serve the
//! HTTP API until interrupted.

use std::sync::Arc;
use std::time::Duration;

use amila::bootstrap::AppContextBuilder;
use amila::config::Settings;
use amila::db::postgres::PostgresAdapter;
use amila::engine::SqliteCheckpointer;
use amila::http::{AuthUser, StaticTokenVerifier, router};
use amila::llm::HttpLanguageModel;
use amila::telemetry::init_tracing;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let settings = Settings::from_env();
    let listen_addr = settings.listen_addr.clone();

    let llm = Arc::new(HttpLanguageModel::new(
        &settings.llm_base_url,
        &settings.llm_api_key,
        &settings.llm_provider,
        &settings.llm_model,
    ));
    let checkpointer = Arc::new(SqliteCheckpointer::connect(&settings.checkpoint_db_url).await?);

    let mut builder = AppContextBuilder::new(settings.clone())
        .with_language_model(llm)
        .with_checkpointer(checkpointer);
    if let Some(postgres_url) = &settings.postgres_url {
        match PostgresAdapter::connect(postgres_url).await {
            Ok(adapter) => builder = builder.with_adapter(Arc::new(adapter)),
            Err(err) => tracing::warn!(error = %err, "postgres adapter unavailable"),
        }
    }
    let context = builder.build()?;

    // Token issuance is external; single-node deployments configure one
    // service token through the environment.
    let verifier = Arc::new(StaticTokenVerifier::new());
    if let Ok(token) = std::env::var("AMILA_API_TOKEN") {
        verifier.insert(
            &token,
            AuthUser {
                user_id: "service".to_string(),
                role: "admin".to_string(),
            },
        );
    }
    let csrf_enforced = std::env::var("AMILA_CSRF_ENFORCED")
        .map(|v| v != "false")
        .unwrap_or(true);

    let maintenance = context.spawn_maintenance(Duration::from_secs(3600));
    let app = router(context.api_state(verifier, csrf_enforced));

    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    tracing::info!(addr = %listen_addr, "amila serving");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("interrupt received, shutting down");
        })
        .await?;

    context.shutdown(Some(maintenance)).await;
    Ok(())
}
