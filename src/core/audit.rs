//! SHA-256 hash-chained audit log.
//!
//! Every domain event (map upsert, run start/finish, DLQ replay, safe-mode
//! flip) is appended as a JSONL entry whose hash covers the previous entry's
//! hash concatenated with the canonical form of the event payload. Any
//! in-place edit breaks the successor link, so the chain is tamper-evident:
//! an attacker with write access can rewrite history, but not invisibly.

use crate::core::error::ForgeFlowError;
use crate::core::fsio;
use crate::core::hash;
use crate::core::store::Store;
use crate::core::time;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;

/// Sentinel `previous_hash` for the first entry in the chain.
pub const GENESIS: &str = "genesis";

/// One link in the audit chain.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: String,
    pub previous_hash: String,
    pub event: Value,
    /// `SHA-256(previous_hash || canonical(event))`, lowercase hex.
    pub hash: String,
}

impl AuditEntry {
    fn compute_hash(previous_hash: &str, event: &Value) -> String {
        let material = format!("{}{}", previous_hash, hash::canonical_json(event));
        hash::sha256_hex(material.as_bytes())
    }

    /// Whether this entry's stored hash reproduces from its own fields.
    pub fn self_consistent(&self) -> bool {
        Self::compute_hash(&self.previous_hash, &self.event) == self.hash
    }
}

/// Outcome of a chain verification pass.
#[derive(Debug, Serialize)]
pub struct ChainReport {
    pub entries: usize,
    /// Index of the first entry whose link or hash fails to reproduce.
    pub first_divergence: Option<usize>,
}

impl ChainReport {
    pub fn intact(&self) -> bool {
        self.first_divergence.is_none()
    }
}

/// Append-only audit chain for one store.
#[derive(Debug, Clone)]
pub struct AuditChain {
    path: PathBuf,
}

impl AuditChain {
    pub fn new(store: &Store) -> Self {
        Self {
            path: store.audit_path(),
        }
    }

    /// Append `event`, linking it to the current tail, and fsync.
    pub fn append(&self, event: Value) -> Result<AuditEntry, ForgeFlowError> {
        let previous_hash = self.tail_hash()?;
        let entry = AuditEntry {
            timestamp: time::now_rfc3339(),
            hash: AuditEntry::compute_hash(&previous_hash, &event),
            previous_hash,
            event,
        };
        fsio::append_jsonl_sync(&self.path, &entry)?;
        Ok(entry)
    }

    /// All entries, in append order.
    pub fn entries(&self) -> Result<Vec<AuditEntry>, ForgeFlowError> {
        fsio::read_jsonl(&self.path)
    }

    /// Verify the whole chain.
    pub fn verify(&self) -> Result<ChainReport, ForgeFlowError> {
        let entries = self.entries()?;
        Ok(Self::verify_entries(&entries, 0))
    }

    /// Verify `[from, to)` of the chain. `from > 0` trusts the stored
    /// `previous_hash` of the first verified entry as the link anchor.
    pub fn verify_range(&self, from: usize, to: usize) -> Result<ChainReport, ForgeFlowError> {
        let entries = self.entries()?;
        let to = to.min(entries.len());
        let slice = if from >= to { &[][..] } else { &entries[from..to] };
        Ok(Self::verify_entries(slice, from))
    }

    fn verify_entries(entries: &[AuditEntry], base_index: usize) -> ChainReport {
        let mut first_divergence = None;
        for (i, entry) in entries.iter().enumerate() {
            let link_ok = if i == 0 {
                // The first verified entry anchors the window: for the whole
                // file that means the genesis sentinel.
                base_index > 0 || entry.previous_hash == GENESIS
            } else {
                entry.previous_hash == entries[i - 1].hash
            };
            if !link_ok || !entry.self_consistent() {
                first_divergence = Some(base_index + i);
                break;
            }
        }
        ChainReport {
            entries: entries.len(),
            first_divergence,
        }
    }

    fn tail_hash(&self) -> Result<String, ForgeFlowError> {
        let entries: Vec<AuditEntry> = fsio::read_jsonl(&self.path)?;
        Ok(entries
            .last()
            .map(|e| e.hash.clone())
            .unwrap_or_else(|| GENESIS.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    fn test_chain() -> (tempfile::TempDir, Store, AuditChain) {
        let tmp = tempdir().unwrap();
        let store = Store::new(tmp.path());
        store.ensure_layout().unwrap();
        let chain = AuditChain::new(&store);
        (tmp, store, chain)
    }

    #[test]
    fn test_first_entry_links_to_genesis() {
        let (_tmp, _store, chain) = test_chain();
        let entry = chain.append(json!({"op": "run.start"})).unwrap();
        assert_eq!(entry.previous_hash, GENESIS);
        assert!(entry.self_consistent());
    }

    #[test]
    fn test_every_entry_links_to_predecessor() {
        let (_tmp, _store, chain) = test_chain();
        for i in 0..4 {
            chain.append(json!({"op": "note", "i": i})).unwrap();
        }
        let entries = chain.entries().unwrap();
        for pair in entries.windows(2) {
            assert_eq!(pair[1].previous_hash, pair[0].hash);
        }
        assert!(chain.verify().unwrap().intact());
    }

    #[test]
    fn test_tampered_payload_is_detected_at_its_index() {
        let (_tmp, store, chain) = test_chain();
        chain.append(json!({"op": "a"})).unwrap();
        chain.append(json!({"op": "b"})).unwrap();
        chain.append(json!({"op": "c"})).unwrap();

        // Edit the middle entry's payload in place.
        let content = std::fs::read_to_string(store.audit_path()).unwrap();
        let tampered = content.replace("\"op\":\"b\"", "\"op\":\"B\"");
        assert_ne!(content, tampered);
        std::fs::write(store.audit_path(), tampered).unwrap();

        let report = chain.verify().unwrap();
        assert_eq!(report.first_divergence, Some(1));
    }

    #[test]
    fn test_verify_range() {
        let (_tmp, _store, chain) = test_chain();
        for i in 0..5 {
            chain.append(json!({"i": i})).unwrap();
        }
        assert!(chain.verify_range(0, 5).unwrap().intact());
        assert!(chain.verify_range(2, 4).unwrap().intact());
        assert_eq!(chain.verify_range(4, 2).unwrap().entries, 0);
    }

    #[test]
    fn test_hash_reproduces_from_prev_and_canonical_event() {
        let (_tmp, _store, chain) = test_chain();
        let event = json!({"z": 1, "a": 2});
        let entry = chain.append(event.clone()).unwrap();
        let material = format!("{}{}", GENESIS, hash::canonical_json(&event));
        assert_eq!(entry.hash, hash::sha256_hex(material.as_bytes()));
    }
}
