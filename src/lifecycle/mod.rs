//! Per-query lifecycle bus: ordered status events with SSE fan-out,
//! last-event replay for late subscribers, and retained copies for
//! reconnection.

pub mod bus;
pub mod event;

pub use bus::{LifecycleBus, Subscription, event_with_stage};
pub use event::{LifecycleEvent, QueryPhase};
