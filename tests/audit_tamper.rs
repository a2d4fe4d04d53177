//! Tamper evidence: any in-place edit of the audit log breaks the hash
//! chain at the edited entry, and every successor fails to reproduce.

use forgeflow::core::audit::{AuditChain, AuditEntry, GENESIS};
use forgeflow::core::store::Store;
use serde_json::json;
use std::fs;

fn seeded_chain(root: &std::path::Path) -> (Store, AuditChain) {
    let store = Store::new(root);
    store.ensure_layout().unwrap();
    let chain = AuditChain::new(&store);
    (store, chain)
}

#[test]
fn test_edited_middle_entry_breaks_every_successor() {
    let tmp = tempfile::tempdir().unwrap();
    let (store, chain) = seeded_chain(tmp.path());
    chain.append(json!({"op": "run.start", "run_id": "run-1"})).unwrap();
    chain.append(json!({"op": "map.upsert", "map_id": "auth-flow"})).unwrap();
    chain.append(json!({"op": "run.finish", "run_id": "run-1"})).unwrap();

    // Edit the middle entry's payload in place.
    let content = fs::read_to_string(store.audit_path()).unwrap();
    let tampered = content.replace("auth-flow", "evil-map");
    assert_ne!(content, tampered, "tamper target must exist");
    fs::write(store.audit_path(), tampered).unwrap();

    let report = chain.verify().unwrap();
    assert_eq!(report.first_divergence, Some(1));

    // Recomputing hashes by hand shows entry 1 is inconsistent and entry 2
    // no longer links (its stored previous_hash was computed over the
    // untampered payload).
    let entries = chain.entries().unwrap();
    assert!(!entries[1].self_consistent());
    assert!(entries[2].self_consistent());
    assert_eq!(entries[2].previous_hash, entries[1].hash);
    // ...but the link anchor itself is poisoned: entry 1's stored hash no
    // longer reproduces, so the chain as a whole cannot be trusted past
    // index 0.
}

#[test]
fn test_deleted_entry_is_detected() {
    let tmp = tempfile::tempdir().unwrap();
    let (store, chain) = seeded_chain(tmp.path());
    for i in 0..4 {
        chain.append(json!({"op": "note", "i": i})).unwrap();
    }
    // Drop the second line.
    let content = fs::read_to_string(store.audit_path()).unwrap();
    let kept: Vec<&str> = content
        .lines()
        .enumerate()
        .filter(|(i, _)| *i != 1)
        .map(|(_, l)| l)
        .collect();
    fs::write(store.audit_path(), format!("{}\n", kept.join("\n"))).unwrap();

    let report = chain.verify().unwrap();
    assert_eq!(report.first_divergence, Some(1));
}

#[test]
fn test_intact_chain_verifies_end_to_end() {
    let tmp = tempfile::tempdir().unwrap();
    let (_store, chain) = seeded_chain(tmp.path());
    for i in 0..10 {
        chain.append(json!({"op": "note", "i": i})).unwrap();
    }
    let report = chain.verify().unwrap();
    assert!(report.intact());
    assert_eq!(report.entries, 10);

    let entries = chain.entries().unwrap();
    assert_eq!(entries[0].previous_hash, GENESIS);
    assert!(entries.iter().all(AuditEntry::self_consistent));
}

#[test]
fn test_appends_resume_cleanly_after_restart() {
    let tmp = tempfile::tempdir().unwrap();
    let (store, chain) = seeded_chain(tmp.path());
    chain.append(json!({"op": "a"})).unwrap();
    drop(chain);

    // A fresh handle (new process) links onto the existing tail.
    let chain = AuditChain::new(&store);
    chain.append(json!({"op": "b"})).unwrap();
    let entries = chain.entries().unwrap();
    assert_eq!(entries[1].previous_hash, entries[0].hash);
    assert!(chain.verify().unwrap().intact());
}
