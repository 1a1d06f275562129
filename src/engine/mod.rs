//! Orchestration engine: routing table, checkpoint infrastructure, and the
//! serial per-query state machine driver.

pub mod checkpoint;
pub mod checkpoint_sqlite;
#[allow(clippy::module_inception)]
pub mod engine;
pub mod routing;

pub use checkpoint::{Checkpoint, Checkpointer, CheckpointerError, InMemoryCheckpointer};
pub use checkpoint_sqlite::SqliteCheckpointer;
pub use engine::{
    EngineError, Orchestrator, RunOutcome, RunStatus, SubmitRequest, outcome_from_checkpoint,
};
