//! Content hashing and canonical JSON.
//!
//! Checksums, audit-chain links, and idempotency keys all hash the *canonical*
//! form of a JSON value: compact separators, object keys in lexicographic
//! order at every depth. Two logically equal documents therefore always hash
//! to the same digest regardless of field order at the call site.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Namespace prefix baked into every ledger idempotency key.
pub const LEDGER_NAMESPACE: &str = "ns=ff6.4";

/// Lowercase SHA-256 hex digest of raw bytes.
pub fn sha256_hex(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Canonical JSON text: compact, keys sorted lexicographically at every depth.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

/// SHA-256 over the canonical JSON form of `value`.
pub fn canonical_sha256(value: &Value) -> String {
    sha256_hex(canonical_json(value).as_bytes())
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // serde_json::to_string on a str cannot fail
                out.push_str(&serde_json::to_string(key).unwrap_or_default());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        other => out.push_str(&other.to_string()),
    }
}

/// Idempotency key for a ledger entry:
/// `SHA-256("ns=ff6.4|" + source_event_id + "|" + canonical(payload) + "|" + scope + "|" + seq)`.
pub fn ledger_idempotency_key(
    source_event_id: &str,
    payload: &Value,
    target_scope: &str,
    seq: u64,
) -> String {
    let material = format!(
        "{}|{}|{}|{}|{}",
        LEDGER_NAMESPACE,
        source_event_id,
        canonical_json(payload),
        target_scope,
        seq
    );
    sha256_hex(material.as_bytes())
}

/// Idempotency key for a dead-letter operation: the hash of its canonical
/// (verb, params, resource) shape. Logically equivalent failures collapse
/// onto one queue entry.
pub fn operation_idempotency_key(verb: &str, params: &Value, resource: &str) -> String {
    let material = format!("{}|{}|{}", verb, canonical_json(params), resource);
    sha256_hex(material.as_bytes())
}
