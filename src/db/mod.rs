//! Database access: backend adapter trait, per-backend error
//! normalization, and the router that dispatches through the resilience
//! layer.

pub mod adapter;
pub mod doris;
pub mod oracle;
pub mod postgres;
pub mod router;

pub use adapter::{DatabaseAdapter, DbError, DbErrorKind, SchemaColumn, SchemaData};
pub use router::{DatabaseRouter, ExecutionReport, RouterConfig};
