//! Graceful degradation strategies.
//!
//! When a non-critical operation fails (or its feature flag is off), the
//! degradation layer substitutes a fallback instead of surfacing the error:
//! a literal value, a recently-cached success, a caller-supplied function of
//! the error, or a neutral skip. Fatal-category errors are never hidden:
//! durability failures always propagate regardless of strategy.

use crate::core::error::{ErrorCategory, ErrorKind, ForgeFlowError};
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DegradationStrategy {
    /// Re-throw the failure unchanged.
    FailFast,
    /// Return the configured literal.
    FallbackValue,
    /// Return the cached last success when fresh, else the literal.
    FallbackCache,
    /// Invoke the fallback function with the error.
    FallbackFunction,
    /// Return a neutral empty value.
    Skip,
}

/// Per-call degradation options.
pub struct DegradeOptions<'a> {
    pub strategy: DegradationStrategy,
    pub fallback_value: Option<Value>,
    pub fallback_fn: Option<&'a dyn Fn(&ForgeFlowError) -> Value>,
    /// Freshness window for `FallbackCache` hits.
    pub cache_ttl: Duration,
    /// Feature flag gating the operation; a disabled flag short-circuits
    /// without invoking the operation at all.
    pub feature: Option<String>,
}

impl Default for DegradeOptions<'_> {
    fn default() -> Self {
        Self {
            strategy: DegradationStrategy::FailFast,
            fallback_value: None,
            fallback_fn: None,
            cache_ttl: Duration::from_secs(30),
            feature: None,
        }
    }
}

#[derive(Debug)]
struct CachedValue {
    value: Value,
    expires_at: Instant,
}

/// Strategy dispatcher with the per-name success cache. One per `Core`;
/// safe for concurrent use.
#[derive(Debug)]
pub struct DegradationManager {
    flags: FxHashMap<String, bool>,
    cache: Mutex<FxHashMap<String, CachedValue>>,
}

impl DegradationManager {
    /// `flags` is the feature-flag map from configuration; unlisted
    /// features are enabled.
    pub fn new(flags: FxHashMap<String, bool>) -> Self {
        Self {
            flags,
            cache: Mutex::new(FxHashMap::default()),
        }
    }

    pub fn flag_enabled(&self, feature: &str) -> bool {
        self.flags.get(feature).copied().unwrap_or(true)
    }

    /// Run `op` under the given strategy.
    pub fn execute<F>(
        &self,
        name: &str,
        op: F,
        options: &DegradeOptions<'_>,
    ) -> Result<Value, ForgeFlowError>
    where
        F: FnOnce() -> Result<Value, ForgeFlowError>,
    {
        if let Some(feature) = &options.feature {
            if !self.flag_enabled(feature) {
                let disabled = ForgeFlowError::fault(
                    ErrorKind::OperationFailed,
                    format!("feature '{}' is disabled", feature),
                );
                return self.degrade(name, disabled, options);
            }
        }

        match op() {
            Ok(value) => {
                if options.strategy == DegradationStrategy::FallbackCache {
                    self.cache_put(name, value.clone(), options.cache_ttl);
                }
                Ok(value)
            }
            Err(error) => self.degrade(name, error, options),
        }
    }

    fn degrade(
        &self,
        name: &str,
        error: ForgeFlowError,
        options: &DegradeOptions<'_>,
    ) -> Result<Value, ForgeFlowError> {
        // Durability errors are never absorbed into a fallback.
        if error.kind().category() == ErrorCategory::Fatal {
            return Err(error);
        }
        match options.strategy {
            DegradationStrategy::FailFast => Err(error),
            DegradationStrategy::FallbackValue => {
                tracing::debug!(name, error = %error, "degrading to literal fallback");
                Ok(options.fallback_value.clone().unwrap_or(Value::Null))
            }
            DegradationStrategy::FallbackCache => match self.cache_get(name) {
                Some(cached) => {
                    tracing::debug!(name, error = %error, "degrading to cached value");
                    Ok(cached)
                }
                None => Ok(options.fallback_value.clone().unwrap_or(Value::Null)),
            },
            DegradationStrategy::FallbackFunction => match options.fallback_fn {
                Some(f) => Ok(f(&error)),
                None => Err(ForgeFlowError::with_cause(
                    ErrorKind::OperationFailed,
                    format!("no fallback function configured for '{}'", name),
                    error,
                )),
            },
            DegradationStrategy::Skip => {
                tracing::debug!(name, error = %error, "skipping failed operation");
                Ok(Value::Null)
            }
        }
    }

    fn cache_put(&self, name: &str, value: Value, ttl: Duration) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.insert(
                name.to_string(),
                CachedValue {
                    value,
                    expires_at: Instant::now() + ttl,
                },
            );
        }
    }

    fn cache_get(&self, name: &str) -> Option<Value> {
        let mut cache = self.cache.lock().ok()?;
        match cache.get(name) {
            Some(cached) if cached.expires_at > Instant::now() => Some(cached.value.clone()),
            Some(_) => {
                cache.remove(name);
                None
            }
            None => None,
        }
    }
}
