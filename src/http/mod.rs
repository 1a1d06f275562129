//! HTTP surface: authentication, the JSON API, and the SSE lifecycle
//! stream.

pub mod api;
pub mod auth;
pub mod sse;

pub use api::{ApiState, OrchestratorQueryResponse, router};
pub use auth::{AuthUser, StaticTokenVerifier, TokenVerifier, issue_stream_token};
