//! Write-ahead journal and atomic document writer.
//!
//! Every document mutation journals an intent before touching the target:
//! the intent (target path, operation, checksum of the canonical payload) is
//! appended to the primary journal and mirrored byte-for-byte to a shadow
//! journal, each fsynced, and only then is the target written via temp file +
//! rename. A crash between journal and target leaves a recoverable intent; a
//! crash after the target write leaves a durable document with a matching
//! journal entry.
//!
//! The journals record intents plus checksums, not payload bodies; recovery
//! is operator-assisted. `recover()` verifies the mirror, reports the pending
//! intents, and truncates both journals.

use crate::core::error::{ErrorKind, ForgeFlowError};
use crate::core::fsio;
use crate::core::hash;
use crate::core::store::Store;
use crate::core::time;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;

/// One journaled write intent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WalEntry {
    pub timestamp: String,
    pub run_id: String,
    /// Target path relative to the store root.
    pub target: String,
    pub operation: String,
    /// SHA-256 of the canonical JSON of the payload.
    pub checksum: String,
}

/// Report produced by [`Wal::recover`].
#[derive(Debug, Serialize)]
pub struct RecoveryReport {
    /// Intents found in the journal at startup. Each may or may not have
    /// reached its target before the crash; the checksum lets an operator
    /// tell which.
    pub pending: Vec<WalEntry>,
    /// Whether the primary and shadow journals were byte-equal.
    pub mirror_intact: bool,
}

/// The dual write-ahead journal for one store.
#[derive(Debug, Clone)]
pub struct Wal {
    store: Store,
}

impl Wal {
    pub fn new(store: &Store) -> Self {
        Self {
            store: store.clone(),
        }
    }

    /// Journal a write intent for `payload` at `target` (relative to the
    /// root). Appends to the primary journal and its shadow, fsyncing each.
    /// Returns the entry so the caller can apply the target write.
    pub fn journal_intent(
        &self,
        target: &str,
        payload: &Value,
        run_id: &str,
    ) -> Result<WalEntry, ForgeFlowError> {
        let entry = WalEntry {
            timestamp: time::now_rfc3339(),
            run_id: run_id.to_string(),
            target: target.to_string(),
            operation: "write".to_string(),
            checksum: hash::canonical_sha256(payload),
        };
        fsio::append_jsonl_sync(&self.store.wal_path(), &entry)?;
        fsio::append_jsonl_sync(&self.store.wal_shadow_path(), &entry)?;
        Ok(entry)
    }

    /// Write the journaled target document and fsync it into place.
    pub fn apply_target(&self, entry: &WalEntry, payload: &Value) -> Result<(), ForgeFlowError> {
        fsio::write_json_atomic(&self.store.resolve(&entry.target), payload)
    }

    /// Verify that the primary and shadow journals are byte-equal.
    /// Divergence is a fatal integrity failure.
    pub fn verify_mirror(&self) -> Result<(), ForgeFlowError> {
        let primary = read_bytes_or_empty(&self.store.wal_path())?;
        let shadow = read_bytes_or_empty(&self.store.wal_shadow_path())?;
        if primary != shadow {
            return Err(ForgeFlowError::fault(
                ErrorKind::WalIntegrity,
                format!(
                    "journal mirror divergence: primary {} bytes, shadow {} bytes",
                    primary.len(),
                    shadow.len()
                ),
            ));
        }
        Ok(())
    }

    /// Startup recovery: verify the mirror, report pending intents, then
    /// truncate both journals. Mirror divergence aborts with `WAL_INTEGRITY`
    /// and leaves both journals untouched for inspection.
    pub fn recover(&self) -> Result<RecoveryReport, ForgeFlowError> {
        self.verify_mirror()?;
        let pending: Vec<WalEntry> = fsio::read_jsonl(&self.store.wal_path())?;
        if !pending.is_empty() {
            tracing::warn!(
                count = pending.len(),
                "found pending write intents; surfacing for operator review"
            );
        }
        fsio::truncate_sync(&self.store.wal_path())?;
        fsio::truncate_sync(&self.store.wal_shadow_path())?;
        Ok(RecoveryReport {
            pending,
            mirror_intact: true,
        })
    }
}

/// Atomic JSON document writer: journal intent, then write the target.
///
/// `atomic_write_json` is the only sanctioned way to mutate a document under
/// the store root. Callers append their audit and ledger entries *after* this
/// returns, so observers of the journals may see intents without effects, but
/// never effects without intents.
pub fn atomic_write_json(
    store: &Store,
    target: &str,
    payload: &Value,
    run_id: &str,
) -> Result<WalEntry, ForgeFlowError> {
    let wal = Wal::new(store);
    let entry = wal.journal_intent(target, payload, run_id)?;
    wal.apply_target(&entry, payload)?;
    Ok(entry)
}

fn read_bytes_or_empty(path: &std::path::Path) -> Result<Vec<u8>, ForgeFlowError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    Ok(fs::read(path)?)
}
