//! Cache/KV adapter: short-lived state, result cache, and index sets.
//!
//! The core talks to its cache through the narrow [`KvStore`] trait.
//! [`InMemoryKv`] is the process-local implementation used by tests and
//! single-node deployments; [`ResilientKv`] wraps any remote implementation
//! with a circuit breaker, a short deadline, and silent degradation to the
//! in-process [`FallbackCache`].

use async_trait::async_trait;
use miette::Diagnostic;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::resilience::{CircuitBreaker, FallbackCache};

/// Errors from KV operations.
#[derive(Debug, Error, Diagnostic)]
pub enum KvError {
    #[error("kv backend error: {0}")]
    #[diagnostic(code(amila::kv::backend))]
    Backend(String),

    #[error("kv operation timed out after {0:?}")]
    #[diagnostic(code(amila::kv::timeout))]
    Timeout(Duration),

    #[error("kv circuit open")]
    #[diagnostic(
        code(amila::kv::circuit_open),
        help("The cache dependency is fast-failing; reads degrade to the fallback cache.")
    )]
    CircuitOpen,
}

/// Narrow cache interface the core depends on: string values with optional
/// TTL plus string sets for index membership.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), KvError>;
    async fn delete(&self, key: &str) -> Result<(), KvError>;
    async fn sadd(&self, key: &str, member: &str) -> Result<(), KvError>;
    async fn srem(&self, key: &str, member: &str) -> Result<(), KvError>;
    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError>;
}

#[derive(Debug, Default)]
struct MemoryInner {
    values: FxHashMap<String, (String, Option<Instant>)>,
    sets: FxHashMap<String, BTreeSet<String>>,
}

/// Process-local KV store. TTLs are enforced lazily on read.
#[derive(Debug, Default)]
pub struct InMemoryKv {
    inner: Mutex<MemoryInner>,
}

impl InMemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut inner = self.inner.lock();
        match inner.values.get(key) {
            Some((_, Some(expiry))) if Instant::now() >= *expiry => {
                inner.values.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), KvError> {
        let expiry = ttl.map(|t| Instant::now() + t);
        self.inner
            .lock()
            .values
            .insert(key.to_string(), (value, expiry));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut inner = self.inner.lock();
        inner.values.remove(key);
        inner.sets.remove(key);
        Ok(())
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), KvError> {
        self.inner
            .lock()
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), KvError> {
        if let Some(set) = self.inner.lock().sets.get_mut(key) {
            set.remove(member);
        }
        Ok(())
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        Ok(self
            .inner
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }
}

/// Resilient wrapper around a remote KV store.
///
/// Every call is gated by the breaker and bounded by a short deadline.
/// When the remote store is unavailable, reads fall back to the in-process
/// LRU (returning `None` when it also misses) and writes are mirrored
/// best-effort so a later fallback read can still hit. Set operations have
/// no fallback representation and degrade to empty results.
pub struct ResilientKv {
    remote: Arc<dyn KvStore>,
    breaker: Arc<CircuitBreaker>,
    fallback: FallbackCache,
    deadline: Duration,
}

impl ResilientKv {
    #[must_use]
    pub fn new(
        remote: Arc<dyn KvStore>,
        breaker: Arc<CircuitBreaker>,
        fallback: FallbackCache,
        deadline: Duration,
    ) -> Self {
        Self {
            remote,
            breaker,
            fallback,
            deadline,
        }
    }

    async fn guarded<T, F>(&self, op: F) -> Result<T, KvError>
    where
        F: std::future::Future<Output = Result<T, KvError>>,
    {
        if !self.breaker.can_attempt() {
            return Err(KvError::CircuitOpen);
        }
        match tokio::time::timeout(self.deadline, op).await {
            Ok(Ok(value)) => {
                self.breaker.record_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.breaker.record_failure();
                Err(err)
            }
            Err(_) => {
                self.breaker.record_failure();
                Err(KvError::Timeout(self.deadline))
            }
        }
    }
}

#[async_trait]
impl KvStore for ResilientKv {
    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        match self.guarded(self.remote.get(key)).await {
            Ok(value) => Ok(value),
            Err(err) => {
                tracing::debug!(key, error = %err, "kv get degraded to fallback");
                Ok(self.fallback.get(key))
            }
        }
    }

    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), KvError> {
        // Mirror into the fallback first so a degraded read can still hit.
        self.fallback.set(key, value.clone(), ttl);
        match self.guarded(self.remote.set(key, value, ttl)).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::debug!(key, error = %err, "kv set degraded to fallback only");
                Ok(())
            }
        }
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.fallback.delete(key);
        match self.guarded(self.remote.delete(key)).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::debug!(key, error = %err, "kv delete degraded");
                Ok(())
            }
        }
    }

    async fn sadd(&self, key: &str, member: &str) -> Result<(), KvError> {
        match self.guarded(self.remote.sadd(key, member)).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::debug!(key, error = %err, "kv sadd dropped (no fallback for sets)");
                Ok(())
            }
        }
    }

    async fn srem(&self, key: &str, member: &str) -> Result<(), KvError> {
        match self.guarded(self.remote.srem(key, member)).await {
            Ok(()) => Ok(()),
            Err(err) => {
                tracing::debug!(key, error = %err, "kv srem dropped");
                Ok(())
            }
        }
    }

    async fn smembers(&self, key: &str) -> Result<Vec<String>, KvError> {
        match self.guarded(self.remote.smembers(key)).await {
            Ok(members) => Ok(members),
            Err(err) => {
                tracing::debug!(key, error = %err, "kv smembers degraded to empty");
                Ok(Vec::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resilience::BreakerConfig;

    struct FailingKv;

    #[async_trait]
    impl KvStore for FailingKv {
        async fn get(&self, _key: &str) -> Result<Option<String>, KvError> {
            Err(KvError::Backend("down".into()))
        }
        async fn set(
            &self,
            _key: &str,
            _value: String,
            _ttl: Option<Duration>,
        ) -> Result<(), KvError> {
            Err(KvError::Backend("down".into()))
        }
        async fn delete(&self, _key: &str) -> Result<(), KvError> {
            Err(KvError::Backend("down".into()))
        }
        async fn sadd(&self, _key: &str, _member: &str) -> Result<(), KvError> {
            Err(KvError::Backend("down".into()))
        }
        async fn srem(&self, _key: &str, _member: &str) -> Result<(), KvError> {
            Err(KvError::Backend("down".into()))
        }
        async fn smembers(&self, _key: &str) -> Result<Vec<String>, KvError> {
            Err(KvError::Backend("down".into()))
        }
    }

    fn resilient(remote: Arc<dyn KvStore>) -> ResilientKv {
        ResilientKv::new(
            remote,
            Arc::new(CircuitBreaker::new("kv", BreakerConfig::default())),
            FallbackCache::new(16, Duration::from_secs(60)),
            Duration::from_millis(100),
        )
    }

    #[tokio::test]
    async fn memory_kv_ttl_expires() {
        let kv = InMemoryKv::new();
        kv.set("k", "v".into(), Some(Duration::from_millis(10)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn memory_kv_sets() {
        let kv = InMemoryKv::new();
        kv.sadd("idx", "a").await.unwrap();
        kv.sadd("idx", "b").await.unwrap();
        kv.srem("idx", "a").await.unwrap();
        assert_eq!(kv.smembers("idx").await.unwrap(), vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn degraded_reads_hit_fallback_after_write() {
        let kv = resilient(Arc::new(FailingKv));
        kv.set("k", "v".into(), None).await.unwrap();
        // Remote is down; the mirrored fallback write still serves the read.
        assert_eq!(kv.get("k").await.unwrap(), Some("v".into()));
    }

    #[tokio::test]
    async fn degraded_reads_of_unknown_keys_are_silent_none() {
        let kv = resilient(Arc::new(FailingKv));
        assert_eq!(kv.get("missing").await.unwrap(), None);
        assert!(kv.smembers("missing").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn breaker_opens_after_repeated_failures() {
        let breaker = Arc::new(CircuitBreaker::new(
            "kv",
            BreakerConfig {
                failure_threshold: 2,
                ..BreakerConfig::default()
            },
        ));
        let kv = ResilientKv::new(
            Arc::new(FailingKv),
            breaker.clone(),
            FallbackCache::new(16, Duration::from_secs(60)),
            Duration::from_millis(100),
        );
        let _ = kv.get("a").await;
        let _ = kv.get("b").await;
        assert_eq!(breaker.state(), crate::resilience::CircuitState::Open);
        // Still degrades silently while open.
        assert_eq!(kv.get("c").await.unwrap(), None);
    }
}
