//! Exponential backoff retry with jitter and deadlines.
//!
//! `with_retry` re-attempts an operation only while its failures are
//! retryable in the taxonomy, sleeping `min(base * 2^k, max)` between
//! attempts with optional ±25 % jitter. The whole chain runs under one outer
//! deadline: each attempt executes on a worker thread and is raced against
//! the remaining budget, so an unresponsive operation is abandoned rather
//! than awaited. A deadline expiry synthesizes a timeout failure that the
//! same invocation never retries.

use crate::core::cancel::CancelToken;
use crate::core::config::RetryDefaults;
use crate::core::error::{ErrorKind, ForgeFlowError};
use rayon::prelude::*;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

/// Retry policy for one call.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts allowed.
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter: bool,
    /// Outer deadline for the whole retry chain.
    pub timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::from(&RetryDefaults::default())
    }
}

impl From<&RetryDefaults> for RetryConfig {
    fn from(defaults: &RetryDefaults) -> Self {
        Self {
            max_retries: defaults.max_retries,
            base_delay: Duration::from_millis(defaults.base_delay_ms),
            max_delay: Duration::from_millis(defaults.max_delay_ms),
            jitter: defaults.jitter,
            timeout: Duration::from_millis(defaults.timeout_ms),
        }
    }
}

/// Backoff before attempt `k + 1`: `min(base * 2^k, max)`, with symmetric
/// ±25 % jitter when enabled.
pub fn compute_delay(config: &RetryConfig, attempt: u32) -> Duration {
    let exp = config
        .base_delay
        .saturating_mul(2u32.saturating_pow(attempt))
        .min(config.max_delay);
    if !config.jitter {
        return exp;
    }
    // Entropy from a fresh ULID's random component; uniform enough for
    // jitter and avoids carrying a PRNG dependency.
    let unit = (ulid::Ulid::new().random() % 10_000) as f64 / 10_000.0;
    let factor = 0.75 + unit * 0.5;
    exp.mul_f64(factor).min(config.max_delay)
}

/// Run `op` under the retry policy. Retries only taxonomy-retryable
/// failures; exhaustion wraps the last cause in `TRANSIENT_5XX` carrying the
/// attempt count.
pub fn with_retry<T, F>(
    op: F,
    config: &RetryConfig,
    cancel: &CancelToken,
) -> Result<T, ForgeFlowError>
where
    F: Fn() -> Result<T, ForgeFlowError> + Send + Sync + 'static,
    T: Send + 'static,
{
    let op = Arc::new(op);
    let deadline = Instant::now() + config.timeout;
    let attempts = config.max_retries.max(1);
    let mut last_error: Option<ForgeFlowError> = None;

    for attempt in 0..attempts {
        if cancel.is_cancelled() {
            return Err(ForgeFlowError::fault(
                ErrorKind::NetworkTimeout,
                "operation cancelled before attempt",
            ));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(deadline_error(attempt));
        }

        match run_attempt(Arc::clone(&op), remaining) {
            AttemptOutcome::Ok(value) => return Ok(value),
            AttemptOutcome::TimedOut => return Err(deadline_error(attempt + 1)),
            AttemptOutcome::Err(error) => {
                if !error.retryable() || attempt + 1 == attempts {
                    if !error.retryable() {
                        return Err(error);
                    }
                    return Err(ForgeFlowError::with_cause(
                        ErrorKind::Transient5xx,
                        format!("retries exhausted after {} attempts", attempts),
                        error,
                    ));
                }
                tracing::debug!(attempt, error = %error, "retrying after transient failure");
                last_error = Some(error);
                let delay = compute_delay(config, attempt)
                    .min(deadline.saturating_duration_since(Instant::now()));
                if !cancel.sleep(delay) {
                    return Err(ForgeFlowError::fault(
                        ErrorKind::NetworkTimeout,
                        "operation cancelled during backoff",
                    ));
                }
            }
        }
    }

    // Unreachable in practice: the loop always returns. Kept for totality.
    Err(last_error.unwrap_or_else(|| deadline_error(attempts)))
}

enum AttemptOutcome<T> {
    Ok(T),
    Err(ForgeFlowError),
    TimedOut,
}

/// Run one attempt on a worker thread, abandoning it if it outlives the
/// remaining budget. An abandoned worker's eventual result is dropped with
/// the channel.
fn run_attempt<T, F>(op: Arc<F>, budget: Duration) -> AttemptOutcome<T>
where
    F: Fn() -> Result<T, ForgeFlowError> + Send + Sync + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        let _ = tx.send(op());
    });
    match rx.recv_timeout(budget) {
        Ok(Ok(value)) => AttemptOutcome::Ok(value),
        Ok(Err(error)) => AttemptOutcome::Err(error),
        Err(_) => AttemptOutcome::TimedOut,
    }
}

fn deadline_error(attempts: u32) -> ForgeFlowError {
    ForgeFlowError::fault(
        ErrorKind::NetworkTimeout,
        format!("operation deadline exceeded after {} attempt(s)", attempts),
    )
}

/// Run `ops` sequentially under one policy, failing fast on the first error.
pub fn batch_retry<T, F>(
    ops: Vec<F>,
    config: &RetryConfig,
    cancel: &CancelToken,
) -> Result<Vec<T>, ForgeFlowError>
where
    F: Fn() -> Result<T, ForgeFlowError> + Send + Sync + 'static,
    T: Send + 'static,
{
    let mut results = Vec::with_capacity(ops.len());
    for op in ops {
        results.push(with_retry(op, config, cancel)?);
    }
    Ok(results)
}

/// Run `ops` in parallel under one policy. Every operation runs to its own
/// outcome; one failure never aborts its siblings.
pub fn parallel_retry<T, F>(
    ops: Vec<F>,
    config: &RetryConfig,
    cancel: &CancelToken,
) -> Vec<Result<T, ForgeFlowError>>
where
    F: Fn() -> Result<T, ForgeFlowError> + Send + Sync + 'static,
    T: Send + 'static,
{
    ops.into_par_iter()
        .map(|op| with_retry(op, config, cancel))
        .collect()
}
