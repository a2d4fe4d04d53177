//! Process-wide health posture and enforcement gates.
//!
//! The health mesh tracks consecutive infrastructure failures in
//! `status/health.json` behind a short-TTL in-memory cache. Three failures in
//! a row flip the store into read-only safe mode; a success while read-only
//! restores it. The [`Guard`] consults the mesh before mutating operations
//! and adds adaptive enforcement whose severity escalates with accumulated
//! violation warnings.

use crate::core::error::{ErrorKind, ForgeFlowError};
use crate::core::fsio;
use crate::core::store::Store;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Consecutive failures that flip the store to read-only.
pub const SAFE_MODE_FAILURE_THRESHOLD: u32 = 3;

/// How long a cached health record stays fresh.
pub const HEALTH_CACHE_TTL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SafeMode {
    Healthy,
    ReadOnly,
}

/// The on-disk health record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthRecord {
    pub safe_mode: SafeMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub since: String,
    pub consecutive_failures: u32,
    pub violation_warnings: u32,
}

impl HealthRecord {
    fn healthy() -> Self {
        Self {
            safe_mode: SafeMode::Healthy,
            reason: None,
            since: time::now_rfc3339(),
            consecutive_failures: 0,
            violation_warnings: 0,
        }
    }
}

#[derive(Debug)]
struct CachedRecord {
    record: HealthRecord,
    fetched_at: Instant,
}

/// Process-wide safe-mode state over `status/health.json`.
#[derive(Debug)]
pub struct HealthMesh {
    path: PathBuf,
    cache: Mutex<Option<CachedRecord>>,
    cache_ttl: Duration,
}

impl HealthMesh {
    pub fn new(store: &Store) -> Self {
        Self::with_cache_ttl(store, HEALTH_CACHE_TTL)
    }

    pub fn with_cache_ttl(store: &Store, cache_ttl: Duration) -> Self {
        Self {
            path: store.health_path(),
            cache: Mutex::new(None),
            cache_ttl,
        }
    }

    /// Current record, from cache when fresh.
    pub fn read(&self) -> Result<HealthRecord, ForgeFlowError> {
        if let Ok(cache) = self.cache.lock() {
            if let Some(cached) = cache.as_ref() {
                if cached.fetched_at.elapsed() < self.cache_ttl {
                    return Ok(cached.record.clone());
                }
            }
        }
        let record = if self.path.exists() {
            fsio::read_json(&self.path)?
        } else {
            HealthRecord::healthy()
        };
        self.fill_cache(&record);
        Ok(record)
    }

    /// Record an infrastructure failure. Reaching the threshold flips the
    /// store to read-only with `reason`.
    pub fn record_failure(&self, reason: &str) -> Result<HealthRecord, ForgeFlowError> {
        let mut record = self.read_uncached()?;
        record.consecutive_failures += 1;
        if record.consecutive_failures >= SAFE_MODE_FAILURE_THRESHOLD
            && record.safe_mode == SafeMode::Healthy
        {
            record.safe_mode = SafeMode::ReadOnly;
            record.reason = Some(reason.to_string());
            record.since = time::now_rfc3339();
            tracing::warn!(
                failures = record.consecutive_failures,
                reason,
                "entering read-only safe mode"
            );
        }
        self.persist(&record)?;
        Ok(record)
    }

    /// Record a success: clears the failure streak and, when read-only,
    /// restores healthy posture and clears the reason.
    pub fn record_success(&self) -> Result<HealthRecord, ForgeFlowError> {
        let mut record = self.read_uncached()?;
        record.consecutive_failures = 0;
        if record.safe_mode == SafeMode::ReadOnly {
            record.safe_mode = SafeMode::Healthy;
            record.reason = None;
            record.since = time::now_rfc3339();
            tracing::info!("leaving read-only safe mode");
        }
        self.persist(&record)?;
        Ok(record)
    }

    /// Whether the process-wide failure circuit is open.
    pub fn is_circuit_open(&self) -> Result<bool, ForgeFlowError> {
        Ok(self.read()?.consecutive_failures >= SAFE_MODE_FAILURE_THRESHOLD)
    }

    /// Count one enforcement violation.
    pub fn record_violation(&self) -> Result<HealthRecord, ForgeFlowError> {
        let mut record = self.read_uncached()?;
        record.violation_warnings += 1;
        self.persist(&record)?;
        Ok(record)
    }

    /// Reset the violation counter (operator action).
    pub fn reset_warnings(&self) -> Result<HealthRecord, ForgeFlowError> {
        let mut record = self.read_uncached()?;
        record.violation_warnings = 0;
        self.persist(&record)?;
        Ok(record)
    }

    fn read_uncached(&self) -> Result<HealthRecord, ForgeFlowError> {
        if self.path.exists() {
            fsio::read_json(&self.path)
        } else {
            Ok(HealthRecord::healthy())
        }
    }

    fn persist(&self, record: &HealthRecord) -> Result<(), ForgeFlowError> {
        fsio::write_json_atomic(&self.path, record)?;
        self.fill_cache(record);
        Ok(())
    }

    fn fill_cache(&self, record: &HealthRecord) {
        if let Ok(mut cache) = self.cache.lock() {
            *cache = Some(CachedRecord {
                record: record.clone(),
                fetched_at: Instant::now(),
            });
        }
    }
}

/// Enforcement severity for [`Guard::adaptive_enforce`]. Escalates with the
/// health record's accumulated `violation_warnings`: 0–2 warn, 3–5 soft
/// block, 6+ hard block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnforcementLevel {
    /// Log and allow.
    Warn,
    /// Refuse unless the caller explicitly overrides.
    SoftBlock,
    /// Refuse unconditionally.
    HardBlock,
}

const SOFT_BLOCK_AFTER: u32 = 3;
const HARD_BLOCK_AFTER: u32 = 6;

/// Gate consulted before every mutating operation.
pub struct Guard<'a> {
    mesh: &'a HealthMesh,
}

impl<'a> Guard<'a> {
    pub fn new(mesh: &'a HealthMesh) -> Self {
        Self { mesh }
    }

    /// Refuse the call when the failure circuit is open or the store is in
    /// read-only safe mode.
    pub fn enforce_safe_mode(&self) -> Result<(), ForgeFlowError> {
        let record = self.mesh.read()?;
        if record.consecutive_failures >= SAFE_MODE_FAILURE_THRESHOLD {
            return Err(ForgeFlowError::fault(
                ErrorKind::CircuitBreakerOpen,
                format!(
                    "process failure circuit open after {} consecutive failures",
                    record.consecutive_failures
                ),
            ));
        }
        if record.safe_mode == SafeMode::ReadOnly {
            return Err(ForgeFlowError::fault(
                ErrorKind::SafeModeReadOnly,
                record
                    .reason
                    .unwrap_or_else(|| "store is in read-only safe mode".to_string()),
            ));
        }
        Ok(())
    }

    /// Current enforcement level, derived from accumulated warnings.
    pub fn enforcement_level(&self) -> Result<EnforcementLevel, ForgeFlowError> {
        let warnings = self.mesh.read()?.violation_warnings;
        Ok(if warnings >= HARD_BLOCK_AFTER {
            EnforcementLevel::HardBlock
        } else if warnings >= SOFT_BLOCK_AFTER {
            EnforcementLevel::SoftBlock
        } else {
            EnforcementLevel::Warn
        })
    }

    /// Adaptive enforcement for an infrastructural operation. Every call
    /// counts a violation; at warn level it is allowed, at soft-block level
    /// it is refused unless `allow_override`, at hard-block level it is
    /// refused unconditionally.
    pub fn adaptive_enforce(
        &self,
        operation: &str,
        allow_override: bool,
    ) -> Result<EnforcementLevel, ForgeFlowError> {
        let level = self.enforcement_level()?;
        self.mesh.record_violation()?;
        match level {
            EnforcementLevel::Warn => {
                tracing::warn!(operation, "infrastructural operation allowed with warning");
                Ok(level)
            }
            EnforcementLevel::SoftBlock if allow_override => {
                tracing::warn!(operation, "soft block overridden by caller");
                Ok(level)
            }
            EnforcementLevel::SoftBlock => Err(ForgeFlowError::fault(
                ErrorKind::SafeModeReadOnly,
                format!("operation '{}' soft-blocked; pass an explicit override to proceed", operation),
            )),
            EnforcementLevel::HardBlock => Err(ForgeFlowError::fault(
                ErrorKind::SafeModeReadOnly,
                format!("operation '{}' hard-blocked by enforcement policy", operation),
            )),
        }
    }
}
