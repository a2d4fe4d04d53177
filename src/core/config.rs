//! Runtime configuration.
//!
//! ForgeFlow reads an optional `forgeflow.toml` next to the store root and a
//! `FORGEFLOW_ROOT` environment override. Absent both, the store lives at
//! `./.forgeflow`. Missing file or missing keys fall back to defaults; a
//! present-but-malformed file is an error rather than a silent default.

use crate::core::error::{ErrorKind, ForgeFlowError};
use rustc_hash::FxHashMap;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the optional configuration file.
pub const CONFIG_FILE_NAME: &str = "forgeflow.toml";

/// Environment variable overriding the store root.
pub const ROOT_ENV_VAR: &str = "FORGEFLOW_ROOT";

/// Default store root relative to the working directory.
pub const DEFAULT_ROOT: &str = ".forgeflow";

/// Retry defaults applied when a call site does not override them.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetryDefaults {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter: bool,
    pub timeout_ms: u64,
}

impl Default for RetryDefaults {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter: true,
            timeout_ms: 60_000,
        }
    }
}

/// Circuit-breaker defaults for breakers created without explicit settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BreakerDefaults {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub timeout_ms: u64,
}

impl Default for BreakerDefaults {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            success_threshold: 2,
            timeout_ms: 60_000,
        }
    }
}

/// Process-wide configuration for a ForgeFlow core.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Store root directory. `FORGEFLOW_ROOT` wins over the file value.
    pub root: PathBuf,
    /// Age in seconds after which a held lock may be stolen.
    pub stale_lock_secs: i64,
    /// Lock acquisition poll interval.
    pub lock_poll_ms: u64,
    pub retry: RetryDefaults,
    pub breaker: BreakerDefaults,
    /// Feature flags consulted by the degradation layer. Absent flags are
    /// enabled.
    pub flags: FxHashMap<String, bool>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            stale_lock_secs: crate::core::lock::STALE_LOCK_SECS,
            lock_poll_ms: 250,
            retry: RetryDefaults::default(),
            breaker: BreakerDefaults::default(),
            flags: FxHashMap::default(),
        }
    }
}

impl CoreConfig {
    /// Load configuration: `forgeflow.toml` under `dir` if present, then the
    /// `FORGEFLOW_ROOT` environment override.
    pub fn load(dir: &Path) -> Result<Self, ForgeFlowError> {
        let path = dir.join(CONFIG_FILE_NAME);
        let mut config = if path.exists() {
            let content = fs::read_to_string(&path)?;
            toml::from_str(&content).map_err(|e| {
                ForgeFlowError::fault(
                    ErrorKind::OperationFailed,
                    format!("malformed {}: {}", CONFIG_FILE_NAME, e),
                )
            })?
        } else {
            Self::default()
        };

        if let Ok(root) = std::env::var(ROOT_ENV_VAR) {
            if !root.trim().is_empty() {
                config.root = PathBuf::from(root);
            }
        }
        Ok(config)
    }

    /// Whether a degradation feature flag is enabled. Unknown flags default
    /// to enabled.
    pub fn flag_enabled(&self, name: &str) -> bool {
        self.flags.get(name).copied().unwrap_or(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.root, PathBuf::from(DEFAULT_ROOT));
        assert_eq!(config.stale_lock_secs, 300);
        assert_eq!(config.lock_poll_ms, 250);
        assert_eq!(config.retry.max_retries, 3);
        assert_eq!(config.breaker.failure_threshold, 3);
        assert!(config.flag_enabled("anything"));
    }

    #[test]
    fn test_load_from_file() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join(CONFIG_FILE_NAME),
            r#"
root = "state"
stale_lock_secs = 120

[retry]
max_retries = 5
jitter = false

[flags]
live_preview = false
"#,
        )
        .unwrap();

        let config = CoreConfig::load(tmp.path()).unwrap();
        assert_eq!(config.root, PathBuf::from("state"));
        assert_eq!(config.stale_lock_secs, 120);
        assert_eq!(config.retry.max_retries, 5);
        assert!(!config.retry.jitter);
        // Unspecified retry keys keep their defaults.
        assert_eq!(config.retry.base_delay_ms, 500);
        assert!(!config.flag_enabled("live_preview"));
        assert!(config.flag_enabled("unlisted"));
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(CONFIG_FILE_NAME), "root = [not toml").unwrap();
        assert!(CoreConfig::load(tmp.path()).is_err());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = CoreConfig::load(tmp.path()).unwrap();
        assert_eq!(config.lock_poll_ms, 250);
    }
}
