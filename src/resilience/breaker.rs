//! Per-target circuit breakers.
//!
//! Each named breaker is a Closed → Open → HalfOpen state machine. Reaching
//! the failure threshold in Closed opens the circuit; while Open, calls fail
//! fast with `SERVICE_UNAVAILABLE` until the timeout has elapsed on the wall
//! clock (no sleeping; the next call observes the clock and probes). In
//! HalfOpen, the success threshold closes the circuit and any failure snaps
//! it back Open with a fresh timeout.

use crate::core::config::BreakerDefaults;
use crate::core::error::{ErrorKind, ForgeFlowError};
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

/// Breaker tuning for one target.
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self::from(&BreakerDefaults::default())
    }
}

impl From<&BreakerDefaults> for BreakerConfig {
    fn from(defaults: &BreakerDefaults) -> Self {
        Self {
            failure_threshold: defaults.failure_threshold,
            success_threshold: defaults.success_threshold,
            timeout: Duration::from_millis(defaults.timeout_ms),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    next_attempt: Option<Instant>,
}

/// One named circuit breaker. Cheap to clone; clones share state.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Arc<Mutex<BreakerInner>>,
}

impl CircuitBreaker {
    pub fn new(name: &str, config: BreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            inner: Arc::new(Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                next_attempt: None,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run `op` through the breaker: admission check, then outcome
    /// recording.
    pub fn call<T, F>(&self, op: F) -> Result<T, ForgeFlowError>
    where
        F: FnOnce() -> Result<T, ForgeFlowError>,
    {
        self.admit()?;
        match op() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(error) => {
                self.record_failure();
                Err(error)
            }
        }
    }

    /// Admission decision. While Open, fails fast until the timeout has
    /// elapsed; the admitting call then probes in HalfOpen.
    pub fn admit(&self) -> Result<(), ForgeFlowError> {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed | BreakerState::HalfOpen => Ok(()),
            BreakerState::Open => {
                let ready = inner
                    .next_attempt
                    .map(|at| Instant::now() >= at)
                    .unwrap_or(true);
                if ready {
                    inner.state = BreakerState::HalfOpen;
                    inner.consecutive_successes = 0;
                    tracing::debug!(breaker = %self.name, "probing half-open circuit");
                    Ok(())
                } else {
                    Err(ForgeFlowError::fault(
                        ErrorKind::ServiceUnavailable,
                        format!("circuit '{}' is open", self.name),
                    ))
                }
            }
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => inner.consecutive_failures = 0,
            BreakerState::HalfOpen => {
                inner.consecutive_successes += 1;
                if inner.consecutive_successes >= self.config.success_threshold {
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.consecutive_successes = 0;
                    inner.next_attempt = None;
                    tracing::info!(breaker = %self.name, "circuit closed");
                }
            }
            BreakerState::Open => {}
        }
    }

    pub fn record_failure(&self) {
        let mut inner = self.lock();
        match inner.state {
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.trip(&mut inner);
                }
            }
            // Any half-open failure snaps straight back to Open.
            BreakerState::HalfOpen => self.trip(&mut inner),
            BreakerState::Open => {}
        }
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Force Closed and clear all counters.
    pub fn reset(&self) {
        let mut inner = self.lock();
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.consecutive_successes = 0;
        inner.next_attempt = None;
    }

    fn trip(&self, inner: &mut BreakerInner) {
        inner.state = BreakerState::Open;
        inner.consecutive_successes = 0;
        inner.next_attempt = Some(Instant::now() + self.config.timeout);
        tracing::warn!(breaker = %self.name, timeout = ?self.config.timeout, "circuit opened");
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BreakerInner> {
        // A poisoned breaker mutex means a panic mid-bookkeeping; recovering
        // the inner state is safe because every transition is a whole value.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Registry handing out one shared breaker per name. Safe for concurrent
/// use; lives on the `Core` value rather than in a global.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    defaults: BreakerConfig,
    breakers: Mutex<FxHashMap<String, CircuitBreaker>>,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerConfig) -> Self {
        Self {
            defaults,
            breakers: Mutex::new(FxHashMap::default()),
        }
    }

    /// The breaker for `name`, created with the registry defaults on first
    /// use.
    pub fn get(&self, name: &str) -> CircuitBreaker {
        let mut map = self
            .breakers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        map.entry(name.to_string())
            .or_insert_with(|| CircuitBreaker::new(name, self.defaults.clone()))
            .clone()
    }

    /// Names of every breaker created so far, with states.
    pub fn snapshot(&self) -> Vec<(String, BreakerState)> {
        let map = self
            .breakers
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<(String, BreakerState)> = map
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.state()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}
