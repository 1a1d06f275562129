//! Circuit breaker guarding calls to external dependencies.
//!
//! One breaker per named resource, three states: `Closed` passes calls
//! through, `Open` fast-fails, `HalfOpen` admits a limited number of probe
//! calls. Counter updates and state transitions happen under one short
//! lock; the guarded call itself runs lock-free.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

/// Breaker state as exposed to health checks and tests.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Tuning knobs for one breaker.
#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    /// Consecutive failures before the circuit opens.
    pub failure_threshold: u32,
    /// How long the circuit stays open before admitting a probe.
    pub recovery_timeout: Duration,
    /// Successes required in half-open before closing.
    pub success_threshold: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            success_threshold: 2,
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failures: u32,
    successes: u32,
    last_failure_time: Option<DateTime<Utc>>,
}

/// A single named circuit breaker.
///
/// # Examples
///
/// ```rust
/// use amila::resilience::{BreakerConfig, CircuitBreaker, CircuitState};
///
/// let breaker = CircuitBreaker::new("oracle", BreakerConfig {
///     failure_threshold: 2,
///     ..BreakerConfig::default()
/// });
/// assert!(breaker.can_attempt());
/// breaker.record_failure();
/// breaker.record_failure();
/// assert_eq!(breaker.state(), CircuitState::Open);
/// assert!(!breaker.can_attempt());
/// ```
#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(name: &str, config: BreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: Mutex::new(BreakerInner {
                state: CircuitState::Closed,
                failures: 0,
                successes: 0,
                last_failure_time: None,
            }),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether a call may be attempted right now.
    ///
    /// An open circuit whose recovery timeout has elapsed transitions to
    /// half-open as a side effect, admitting the probe call.
    pub fn can_attempt(&self) -> bool {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let elapsed = inner
                    .last_failure_time
                    .map(|t| Utc::now() - t)
                    .unwrap_or_else(ChronoDuration::zero);
                let recovery =
                    ChronoDuration::from_std(self.config.recovery_timeout).unwrap_or_default();
                if elapsed >= recovery {
                    tracing::info!(breaker = %self.name, "circuit half-open, admitting probe");
                    inner.state = CircuitState::HalfOpen;
                    inner.successes = 0;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.state {
            CircuitState::Closed => {
                inner.failures = 0;
            }
            CircuitState::HalfOpen => {
                inner.successes += 1;
                if inner.successes >= self.config.success_threshold {
                    tracing::info!(breaker = %self.name, "circuit closed after recovery");
                    inner.state = CircuitState::Closed;
                    inner.failures = 0;
                    inner.successes = 0;
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Record a failed call. Opens the circuit at the failure threshold and
    /// re-opens immediately on any half-open failure.
    pub fn record_failure(&self) {
        let mut inner = self.inner.lock();
        inner.last_failure_time = Some(Utc::now());
        match inner.state {
            CircuitState::Closed => {
                inner.failures += 1;
                if inner.failures >= self.config.failure_threshold {
                    tracing::warn!(
                        breaker = %self.name,
                        failures = inner.failures,
                        "circuit opened"
                    );
                    inner.state = CircuitState::Open;
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(breaker = %self.name, "probe failed, circuit re-opened");
                inner.state = CircuitState::Open;
                inner.successes = 0;
            }
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Snapshot for health reporting.
    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.inner.lock();
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            failures: inner.failures,
            successes: inner.successes,
            last_failure_time: inner.last_failure_time,
        }
    }
}

/// Point-in-time view of one breaker, serialized into `/health`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub failures: u32,
    pub successes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<DateTime<Utc>>,
}

/// Process-wide registry of breakers, keyed by resource name.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    default_config: BreakerConfig,
    breakers: Mutex<FxHashMap<String, Arc<CircuitBreaker>>>,
}

impl BreakerRegistry {
    #[must_use]
    pub fn new(default_config: BreakerConfig) -> Self {
        Self {
            default_config,
            breakers: Mutex::new(FxHashMap::default()),
        }
    }

    /// Fetch the breaker for `name`, creating it with the default config on
    /// first use.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::new(name, self.default_config)))
            .clone()
    }

    /// Snapshots of every registered breaker.
    pub fn snapshots(&self) -> Vec<BreakerSnapshot> {
        self.breakers
            .lock()
            .values()
            .map(|b| b.snapshot())
            .collect()
    }
}
