//! # Amila: natural-language-to-SQL orchestration service
//!
//! Users submit questions in prose; the service produces a validated SQL
//! query against a chosen backend (Oracle, Doris, or PostgreSQL), pauses
//! for human approval, executes the query, validates the results, and
//! streams progress to the caller over SSE.
//!
//! The heart of the crate is a checkpointed, resumable, per-query state
//! machine that interleaves language-model reasoning with schema
//! retrieval, validation, execution, and bounded repair/fallback/pivot
//! loops.
//!
//! ## Core concepts
//!
//! - **Nodes**: Async units of work mutating one query's typed state
//! - **Routing table**: Static, total successor sets; unknown transitions
//!   are rejected fail-closed
//! - **Checkpoints**: A durable [`QueryState`](state::QueryState) snapshot
//!   after every node, keyed by `thread_id`, enabling suspension and
//!   resumption (the HITL approval gate is a checkpoint plus a return, not
//!   a parked task)
//! - **Lifecycle bus**: Ordered per-query status events with SSE fan-out
//!   and at-most-once terminal emission
//! - **Resilience**: Circuit breakers, classified retries, and an LRU
//!   fallback cache shared by every external call
//!
//! ## Quick tour
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use amila::bootstrap::AppContextBuilder;
//! use amila::config::Settings;
//! use amila::engine::SubmitRequest;
//! use amila::llm::HttpLanguageModel;
//! use amila::types::DatabaseType;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let settings = Settings::from_env();
//! let llm = Arc::new(HttpLanguageModel::new(
//!     &settings.llm_base_url,
//!     &settings.llm_api_key,
//!     &settings.llm_provider,
//!     &settings.llm_model,
//! ));
//! let context = AppContextBuilder::new(settings)
//!     .with_language_model(llm)
//!     .build()?;
//!
//! let outcome = context
//!     .engine
//!     .submit(SubmitRequest {
//!         query: "Show a tiny sample from any safe table.".into(),
//!         database_type: DatabaseType::Oracle,
//!         ..SubmitRequest::default()
//!     })
//!     .await?;
//! println!("query {} is {:?}", outcome.state.query_id, outcome.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Module guide
//!
//! - [`engine`] - State machine driver, routing table, checkpointers
//! - [`nodes`] - The fifteen pipeline node implementations
//! - [`state`] - The typed per-query working state
//! - [`lifecycle`] - Per-query event bus and SSE payloads
//! - [`resilience`] - Circuit breakers, retries, fallback cache
//! - [`db`] - Backend adapters, error normalization, the router
//! - [`results`] - Result cache and reference indirection
//! - [`approval`] - HITL decision application and resumption
//! - [`webhooks`] - Terminal-event fan-out with signed delivery
//! - [`http`] - Axum API surface and SSE transport
//! - [`bootstrap`] - The explicit dependency container

pub mod approval;
pub mod bootstrap;
pub mod config;
pub mod db;
pub mod engine;
pub mod http;
pub mod kv;
pub mod lifecycle;
pub mod llm;
pub mod message;
pub mod node;
pub mod nodes;
pub mod resilience;
pub mod results;
pub mod sql;
pub mod state;
pub mod telemetry;
pub mod types;
pub mod webhooks;
