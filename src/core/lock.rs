//! Single-writer advisory lock over the store root.
//!
//! All mutating operations on the durable root serialize through one lock
//! record at `_wal/transaction.lock`. Acquisition polls the record; a holder
//! whose `acquired_at` is older than [`STALE_LOCK_SECS`] is presumed dead and
//! its lock is stolen, recording the displaced owner. The lock is advisory:
//! it coordinates cooperating processes on one host, nothing more.
//!
//! Filesystem errors propagate unchanged; the primitive never retries.

use crate::core::cancel::CancelToken;
use crate::core::error::{ErrorKind, ForgeFlowError};
use crate::core::fsio;
use crate::core::store::Store;
use crate::core::time;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// Age in seconds after which a held lock may be stolen. The single
/// authoritative value; `CoreConfig` may override it per process.
pub const STALE_LOCK_SECS: i64 = 300;

/// On-disk lock record. Created unlocked on first acquire, mutated only by
/// acquire/steal/release, never deleted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockRecord {
    pub locked: bool,
    pub owner: String,
    pub acquired_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stolen_from: Option<String>,
}

impl LockRecord {
    fn unlocked() -> Self {
        Self {
            locked: false,
            owner: String::new(),
            acquired_at: time::now_rfc3339(),
            stolen_from: None,
        }
    }
}

/// The transaction lock for one store root.
#[derive(Debug, Clone)]
pub struct TransactionLock {
    path: PathBuf,
    poll_interval: Duration,
    stale_after_secs: i64,
}

impl TransactionLock {
    pub fn new(store: &Store) -> Self {
        Self {
            path: store.lock_path(),
            poll_interval: Duration::from_millis(250),
            stale_after_secs: STALE_LOCK_SECS,
        }
    }

    pub fn with_settings(store: &Store, poll_interval: Duration, stale_after_secs: i64) -> Self {
        Self {
            path: store.lock_path(),
            poll_interval,
            stale_after_secs,
        }
    }

    /// Acquire the lock for `owner`, polling until `max_wait` elapses.
    ///
    /// A stale holder (older than the stale threshold) is stolen exactly
    /// once, recording the displaced owner in `stolen_from`. Fails with
    /// `LOCK_TIMEOUT` when `max_wait` runs out. Safe-mode gating belongs to
    /// the Guard; this primitive knows nothing of health.
    pub fn acquire(
        &self,
        owner: &str,
        max_wait: Duration,
        cancel: &CancelToken,
    ) -> Result<LockGuard, ForgeFlowError> {
        let deadline = std::time::Instant::now() + max_wait;
        loop {
            if self.try_take(owner)? {
                return Ok(LockGuard::new(self.clone(), owner.to_string()));
            }

            if std::time::Instant::now() >= deadline {
                return Err(ForgeFlowError::fault(
                    ErrorKind::LockTimeout,
                    format!(
                        "could not acquire transaction lock for '{}' within {:?}",
                        owner, max_wait
                    ),
                ));
            }
            if !cancel.sleep(self.poll_interval) {
                return Err(ForgeFlowError::fault(
                    ErrorKind::LockTimeout,
                    "lock acquisition cancelled",
                ));
            }
        }
    }

    /// One guarded read-modify-write pass: take the lock if it is free or
    /// stale, under the in-process mutex for this lock path so concurrent
    /// in-process acquirers cannot both observe it free.
    fn try_take(&self, owner: &str) -> Result<bool, ForgeFlowError> {
        let rmw = rmw_lock(&self.path);
        let _guard = rmw
            .lock()
            .map_err(|_| ForgeFlowError::fault(ErrorKind::OperationFailed, "lock mutex poisoned"))?;

        match self.read_record()? {
            Some(record) if record.locked => {
                let age = time::age_seconds(&record.acquired_at, chrono::Utc::now());
                if age <= self.stale_after_secs {
                    return Ok(false);
                }
                self.write_record(&LockRecord {
                    locked: true,
                    owner: owner.to_string(),
                    acquired_at: time::now_rfc3339(),
                    stolen_from: Some(record.owner.clone()),
                })?;
                tracing::warn!(
                    stolen_from = %record.owner,
                    age_secs = age,
                    "stole stale transaction lock"
                );
                Ok(true)
            }
            _ => {
                // Unlocked or never created: take it.
                self.write_record(&LockRecord {
                    locked: true,
                    owner: owner.to_string(),
                    acquired_at: time::now_rfc3339(),
                    stolen_from: None,
                })?;
                Ok(true)
            }
        }
    }

    /// Unconditionally rewrite the record to the unlocked shape and fsync.
    pub fn release(&self) -> Result<(), ForgeFlowError> {
        self.write_record(&LockRecord::unlocked())
    }

    /// Release only after confirming `owner` still holds the lock.
    pub fn release_if_owner(&self, owner: &str) -> Result<(), ForgeFlowError> {
        self.verify_owner(owner)?;
        self.release()
    }

    /// Current record, if the lock file exists.
    pub fn read_record(&self) -> Result<Option<LockRecord>, ForgeFlowError> {
        if !self.path.exists() {
            return Ok(None);
        }
        Ok(Some(fsio::read_json(&self.path)?))
    }

    /// Confirm `owner` still holds the lock. An observed owner change after
    /// acquire means another process stole it mid-operation; the current
    /// operation must abort.
    pub fn verify_owner(&self, owner: &str) -> Result<(), ForgeFlowError> {
        match self.read_record()? {
            Some(record) if record.locked && record.owner == owner => Ok(()),
            Some(record) => Err(ForgeFlowError::fault(
                ErrorKind::LockTimeout,
                format!(
                    "transaction lock owner changed: expected '{}', found '{}'",
                    owner,
                    if record.locked { record.owner } else { "<unlocked>".to_string() }
                ),
            )),
            None => Err(ForgeFlowError::fault(
                ErrorKind::LockTimeout,
                "transaction lock record disappeared while held",
            )),
        }
    }

    fn write_record(&self, record: &LockRecord) -> Result<(), ForgeFlowError> {
        fsio::write_json_atomic(&self.path, record)
    }
}

// Serialize lock-record read-modify-writes per path within the process.
// Cross-process exclusion rests on the advisory record itself.
fn rmw_lock_map() -> &'static Mutex<HashMap<PathBuf, Arc<Mutex<()>>>> {
    static RMW_LOCKS: OnceLock<Mutex<HashMap<PathBuf, Arc<Mutex<()>>>>> = OnceLock::new();
    RMW_LOCKS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn rmw_lock(path: &Path) -> Arc<Mutex<()>> {
    let mut map = rmw_lock_map()
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    map.entry(path.to_path_buf())
        .or_insert_with(|| Arc::new(Mutex::new(())))
        .clone()
}

/// RAII guard for a held transaction lock. Dropping the guard releases the
/// lock so cancellation or error unwind cannot leak a held lock; release
/// failures on the drop path are logged, not panicked.
#[derive(Debug)]
pub struct LockGuard {
    lock: TransactionLock,
    owner: String,
    released: bool,
}

impl LockGuard {
    fn new(lock: TransactionLock, owner: String) -> Self {
        Self {
            lock,
            owner,
            released: false,
        }
    }

    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Confirm this guard's owner still holds the on-disk record.
    pub fn verify(&self) -> Result<(), ForgeFlowError> {
        self.lock.verify_owner(&self.owner)
    }

    /// Release explicitly, surfacing any filesystem error.
    pub fn release(mut self) -> Result<(), ForgeFlowError> {
        self.released = true;
        self.lock.release()
    }

    /// Consume the guard without releasing: the on-disk record stays held.
    /// Used by run lifecycles that span processes, where `finish` releases
    /// by owner instead of by guard scope.
    pub fn detach(mut self) {
        self.released = true;
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.lock.release() {
                tracing::warn!(owner = %self.owner, error = %e, "failed to release transaction lock on drop");
            }
        }
    }
}
