//! Resilience primitives shared by the database router, the KV store, and
//! webhook delivery: circuit breakers, classified retries with exponential
//! backoff, and an in-process LRU fallback cache.

pub mod breaker;
pub mod fallback_cache;
pub mod retry;

pub use breaker::{
    BreakerConfig, BreakerRegistry, BreakerSnapshot, CircuitBreaker, CircuitState,
};
pub use fallback_cache::FallbackCache;
pub use retry::{BackoffPolicy, Recoverable, retry_with_backoff};
