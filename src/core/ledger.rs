//! Monotonic, idempotency-keyed event ledger.
//!
//! The ledger is the store's ordered stream of domain events. Sequence
//! numbers are strictly increasing across the whole file and are reserved by
//! writing the sequence record *before* the ledger append: a crash between
//! the two burns a number but can never reuse one. Each entry carries an
//! idempotency key hashed over the namespaced
//! (source event, canonical payload, scope, seq) tuple; an append that
//! observes its own key already present is a no-op.

use crate::core::error::ForgeFlowError;
use crate::core::fsio;
use crate::core::hash;
use crate::core::store::Store;
use crate::core::time;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The sequence record at `status/seq.json`. Mutated only by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SequenceRecord {
    pub monotonic_seq: u64,
}

/// One ledger entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub timestamp: String,
    pub source_event_id: String,
    pub idempotency_key: String,
    pub monotonic_seq: u64,
    pub target_scope: String,
    pub payload: Value,
}

/// Append-only event ledger for one store.
#[derive(Debug, Clone)]
pub struct EventLedger {
    store: Store,
}

impl EventLedger {
    pub fn new(store: &Store) -> Self {
        Self {
            store: store.clone(),
        }
    }

    /// Append an event, reserving the next sequence number. Returns the
    /// written entry, or the existing one when the computed idempotency key
    /// is already present.
    pub fn append(
        &self,
        source_event_id: &str,
        payload: Value,
        target_scope: &str,
    ) -> Result<LedgerEntry, ForgeFlowError> {
        let current = self.current_seq()?;
        let seq = current + 1;
        let key = hash::ledger_idempotency_key(source_event_id, &payload, target_scope, seq);

        if let Some(existing) = self.find_by_key(&key)? {
            return Ok(existing);
        }

        // Reserve the number before the append: a crash here leaves a gap,
        // never a reuse.
        fsio::write_json_atomic(&self.store.seq_path(), &SequenceRecord { monotonic_seq: seq })?;

        let entry = LedgerEntry {
            timestamp: time::now_rfc3339(),
            source_event_id: source_event_id.to_string(),
            idempotency_key: key,
            monotonic_seq: seq,
            target_scope: target_scope.to_string(),
            payload,
        };
        fsio::append_jsonl_sync(&self.store.ledger_path(), &entry)?;
        Ok(entry)
    }

    /// Current sequence value: the on-disk record, or the ledger tail when
    /// the record trails it (a crash after append is impossible by ordering,
    /// but a hand-edited record must not cause reuse).
    pub fn current_seq(&self) -> Result<u64, ForgeFlowError> {
        let recorded = if self.store.seq_path().exists() {
            fsio::read_json::<SequenceRecord>(&self.store.seq_path())?.monotonic_seq
        } else {
            0
        };
        let tail = self
            .entries()?
            .last()
            .map(|e| e.monotonic_seq)
            .unwrap_or(0);
        Ok(recorded.max(tail))
    }

    /// All entries in append order.
    pub fn entries(&self) -> Result<Vec<LedgerEntry>, ForgeFlowError> {
        fsio::read_jsonl(&self.store.ledger_path())
    }

    fn find_by_key(&self, key: &str) -> Result<Option<LedgerEntry>, ForgeFlowError> {
        Ok(self
            .entries()?
            .into_iter()
            .find(|e| e.idempotency_key == key))
    }

    /// Check the whole file's invariants: strictly increasing sequence,
    /// unique idempotency keys. Returns the indices of offending entries.
    pub fn verify(&self) -> Result<Vec<usize>, ForgeFlowError> {
        let entries = self.entries()?;
        let mut offenders = Vec::new();
        let mut seen_keys = std::collections::HashSet::new();
        let mut last_seq = 0u64;
        for (i, entry) in entries.iter().enumerate() {
            if entry.monotonic_seq <= last_seq || !seen_keys.insert(entry.idempotency_key.clone()) {
                offenders.push(i);
                continue;
            }
            last_seq = entry.monotonic_seq;
        }
        Ok(offenders)
    }
}
