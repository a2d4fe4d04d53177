//! Per-target health checks with restart hooks.
//!
//! Each target wraps a caller-supplied probe raced against a timeout. A probe
//! that errors (or times out) is a failure; consecutive-success and
//! consecutive-failure counters drive the
//! `Unknown → {Healthy ↔ Degraded → Unhealthy}` machine. An unhealthy target
//! with auto-restart enabled invokes its restart hook at most once per
//! cooldown window, and the completed hook resets the target to `Unknown`.
//! The aggregate status of a registry is its worst member.

use crate::core::cancel::CancelToken;
use crate::core::error::ForgeFlowError;
use rayon::prelude::*;
use rustc_hash::FxHashMap;
use std::sync::{Arc, Mutex, mpsc};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeStatus {
    // Ordered by increasing severity for worst-of aggregation.
    Healthy,
    Unknown,
    Degraded,
    Unhealthy,
}

/// Probe closure: success is `Ok`, any error is a failure.
pub type Probe = Arc<dyn Fn() -> Result<(), ForgeFlowError> + Send + Sync>;

/// Restart hook invoked on an unhealthy target.
pub type RestartHook = Arc<dyn Fn() + Send + Sync>;

/// Per-target tuning.
#[derive(Debug, Clone)]
pub struct CheckConfig {
    /// Probe timeout; an overrun counts as a failure.
    pub timeout: Duration,
    /// Consecutive successes required to become healthy.
    pub healthy_threshold: u32,
    /// Consecutive failures required to become unhealthy.
    pub unhealthy_threshold: u32,
    pub auto_restart: bool,
    pub restart_cooldown: Duration,
}

impl Default for CheckConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(5),
            healthy_threshold: 2,
            unhealthy_threshold: 3,
            auto_restart: false,
            restart_cooldown: Duration::from_secs(60),
        }
    }
}

#[derive(Debug)]
struct CheckState {
    status: ProbeStatus,
    consecutive_successes: u32,
    consecutive_failures: u32,
    last_restart: Option<Instant>,
    restarts: u32,
}

/// One monitored target.
pub struct HealthCheck {
    name: String,
    config: CheckConfig,
    probe: Probe,
    restart: Option<RestartHook>,
    state: Mutex<CheckState>,
}

impl HealthCheck {
    pub fn new(name: &str, config: CheckConfig, probe: Probe, restart: Option<RestartHook>) -> Self {
        Self {
            name: name.to_string(),
            config,
            probe,
            restart,
            state: Mutex::new(CheckState {
                status: ProbeStatus::Unknown,
                consecutive_successes: 0,
                consecutive_failures: 0,
                last_restart: None,
                restarts: 0,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> ProbeStatus {
        self.lock().status
    }

    pub fn restarts(&self) -> u32 {
        self.lock().restarts
    }

    /// Run one probe and fold the outcome into the status machine.
    /// Returns the resulting status.
    pub fn check(&self) -> ProbeStatus {
        let succeeded = self.run_probe();
        let mut state = self.lock();
        if succeeded {
            state.consecutive_successes += 1;
            state.consecutive_failures = 0;
            if state.consecutive_successes >= self.config.healthy_threshold {
                state.status = ProbeStatus::Healthy;
            }
        } else {
            state.consecutive_failures += 1;
            state.consecutive_successes = 0;
            state.status = if state.consecutive_failures >= self.config.unhealthy_threshold {
                ProbeStatus::Unhealthy
            } else {
                ProbeStatus::Degraded
            };
        }

        if state.status == ProbeStatus::Unhealthy {
            self.maybe_restart(&mut state);
        }
        state.status
    }

    fn maybe_restart(&self, state: &mut std::sync::MutexGuard<'_, CheckState>) {
        let Some(hook) = &self.restart else {
            return;
        };
        if !self.config.auto_restart {
            return;
        }
        let cooled_down = state
            .last_restart
            .map(|at| at.elapsed() >= self.config.restart_cooldown)
            .unwrap_or(true);
        if !cooled_down {
            return;
        }
        tracing::warn!(target = %self.name, "restarting unhealthy target");
        hook();
        state.last_restart = Some(Instant::now());
        state.restarts += 1;
        // A restarted target starts over: counters cleared, status unknown.
        state.status = ProbeStatus::Unknown;
        state.consecutive_failures = 0;
        state.consecutive_successes = 0;
    }

    /// Race the probe against its timeout on a worker thread. A panicking
    /// probe drops its channel and counts as a failure.
    fn run_probe(&self) -> bool {
        let (tx, rx) = mpsc::channel();
        let probe = Arc::clone(&self.probe);
        std::thread::spawn(move || {
            let _ = tx.send(probe());
        });
        matches!(rx.recv_timeout(self.config.timeout), Ok(Ok(())))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CheckState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Registry of monitored targets.
#[derive(Default)]
pub struct HealthCheckRegistry {
    checks: Mutex<FxHashMap<String, Arc<HealthCheck>>>,
}

impl HealthCheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, check: HealthCheck) -> Arc<HealthCheck> {
        let check = Arc::new(check);
        let mut map = self.checks.lock().unwrap_or_else(|e| e.into_inner());
        map.insert(check.name().to_string(), Arc::clone(&check));
        check
    }

    /// Probe every target concurrently; returns per-target statuses.
    pub fn check_all(&self) -> Vec<(String, ProbeStatus)> {
        let checks: Vec<Arc<HealthCheck>> = {
            let map = self.checks.lock().unwrap_or_else(|e| e.into_inner());
            map.values().cloned().collect()
        };
        let mut results: Vec<(String, ProbeStatus)> = checks
            .par_iter()
            .map(|check| (check.name().to_string(), check.check()))
            .collect();
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }

    /// Worst status across all targets; an empty registry is `Unknown`.
    pub fn aggregate_status(&self) -> ProbeStatus {
        let map = self.checks.lock().unwrap_or_else(|e| e.into_inner());
        map.values()
            .map(|check| check.status())
            .max()
            .unwrap_or(ProbeStatus::Unknown)
    }

    /// Whether the whole mesh is healthy: non-empty and every target
    /// healthy.
    pub fn all_healthy(&self) -> bool {
        let map = self.checks.lock().unwrap_or_else(|e| e.into_inner());
        !map.is_empty() && map.values().all(|c| c.status() == ProbeStatus::Healthy)
    }

    /// Run `check_all` every `interval` until cancelled. Blocks the calling
    /// thread; spawn it on a dedicated one.
    pub fn run_ticker(&self, interval: Duration, cancel: &CancelToken) {
        while cancel.sleep(interval) {
            self.check_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ErrorKind;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    fn fast_config() -> CheckConfig {
        CheckConfig {
            timeout: Duration::from_millis(200),
            healthy_threshold: 2,
            unhealthy_threshold: 2,
            auto_restart: false,
            restart_cooldown: Duration::from_secs(60),
        }
    }

    fn ok_probe() -> Probe {
        Arc::new(|| Ok(()))
    }

    fn failing_probe() -> Probe {
        Arc::new(|| Err(ForgeFlowError::fault(ErrorKind::NetworkTimeout, "down")))
    }

    #[test]
    fn test_starts_unknown_and_reaches_healthy() {
        let check = HealthCheck::new("db", fast_config(), ok_probe(), None);
        assert_eq!(check.status(), ProbeStatus::Unknown);
        assert_eq!(check.check(), ProbeStatus::Unknown); // 1 of 2
        assert_eq!(check.check(), ProbeStatus::Healthy);
    }

    #[test]
    fn test_failures_degrade_then_unhealthy() {
        let check = HealthCheck::new("db", fast_config(), failing_probe(), None);
        assert_eq!(check.check(), ProbeStatus::Degraded);
        assert_eq!(check.check(), ProbeStatus::Unhealthy);
    }

    #[test]
    fn test_timeout_counts_as_failure() {
        let config = CheckConfig {
            timeout: Duration::from_millis(30),
            healthy_threshold: 1,
            unhealthy_threshold: 1,
            ..fast_config()
        };
        let slow: Probe = Arc::new(|| {
            std::thread::sleep(Duration::from_secs(10));
            Ok(())
        });
        let check = HealthCheck::new("slow", config, slow, None);
        let start = Instant::now();
        assert_eq!(check.check(), ProbeStatus::Unhealthy);
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_recovery_climbs_back_through_thresholds() {
        let healthy_now = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&healthy_now);
        let probe: Probe = Arc::new(move || {
            if flag.load(Ordering::SeqCst) {
                Ok(())
            } else {
                Err(ForgeFlowError::fault(ErrorKind::NetworkTimeout, "down"))
            }
        });
        let check = HealthCheck::new("db", fast_config(), probe, None);
        check.check();
        check.check();
        assert_eq!(check.status(), ProbeStatus::Unhealthy);

        healthy_now.store(true, Ordering::SeqCst);
        assert_eq!(check.check(), ProbeStatus::Unhealthy); // 1 of 2
        assert_eq!(check.check(), ProbeStatus::Healthy);
    }

    #[test]
    fn test_restart_hook_fires_once_per_cooldown_and_resets() {
        let restarts = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&restarts);
        let hook: RestartHook = Arc::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let config = CheckConfig {
            timeout: Duration::from_millis(200),
            healthy_threshold: 1,
            unhealthy_threshold: 1,
            auto_restart: true,
            restart_cooldown: Duration::from_secs(60),
        };
        let check = HealthCheck::new("db", config, failing_probe(), Some(hook));

        assert_eq!(check.check(), ProbeStatus::Unknown); // restarted, reset
        assert_eq!(restarts.load(Ordering::SeqCst), 1);

        // Next failure is within the cooldown: unhealthy, but no new restart.
        assert_eq!(check.check(), ProbeStatus::Unhealthy);
        assert_eq!(restarts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_aggregate_is_worst_of_members() {
        let registry = HealthCheckRegistry::new();
        let healthy = registry.register(HealthCheck::new(
            "good",
            CheckConfig {
                healthy_threshold: 1,
                ..fast_config()
            },
            ok_probe(),
            None,
        ));
        healthy.check();
        assert_eq!(registry.aggregate_status(), ProbeStatus::Healthy);
        assert!(registry.all_healthy());

        let bad = registry.register(HealthCheck::new("bad", fast_config(), failing_probe(), None));
        bad.check();
        assert_eq!(registry.aggregate_status(), ProbeStatus::Degraded);
        bad.check();
        assert_eq!(registry.aggregate_status(), ProbeStatus::Unhealthy);
        assert!(!registry.all_healthy());
    }

    #[test]
    fn test_empty_registry_is_not_healthy() {
        let registry = HealthCheckRegistry::new();
        assert_eq!(registry.aggregate_status(), ProbeStatus::Unknown);
        assert!(!registry.all_healthy());
    }

    #[test]
    fn test_check_all_probes_every_target() {
        let registry = HealthCheckRegistry::new();
        registry.register(HealthCheck::new("a", fast_config(), ok_probe(), None));
        registry.register(HealthCheck::new("b", fast_config(), failing_probe(), None));
        let results = registry.check_all();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].0, "a");
        assert_eq!(results[1].1, ProbeStatus::Degraded);
    }
}
