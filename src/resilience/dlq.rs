//! Durable dead-letter queue for failed, reproducible operations.
//!
//! A failed user-initiated operation is quarantined as one document under
//! `_dlq/`, keyed by the hash of its canonical (verb, params, resource)
//! shape: logically equivalent failures collapse into a single entry whose
//! attempt counter grows. Replay drives the entry through
//! `failed → in_progress → {resolved | failed}`; resolution is terminal and
//! replaying a resolved entry is a no-op.

use crate::core::audit::AuditChain;
use crate::core::error::{ErrorKind, ForgeFlowError};
use crate::core::fsio;
use crate::core::hash;
use crate::core::schemas::{DLQ_SCHEMA_NAME, SchemaValidator};
use crate::core::store::Store;
use crate::core::time;
use crate::core::wal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DlqStatus {
    Failed,
    InProgress,
    Resolved,
}

/// The operation shape that failed. Verb and resource name the dispatch;
/// params carry the reproducible arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqOperation {
    pub verb: String,
    pub params: Value,
    pub resource: String,
}

/// The classified failure that sent the operation here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqFailure {
    pub kind: String,
    pub message: String,
}

impl DlqFailure {
    pub fn from_error(error: &ForgeFlowError) -> Self {
        Self {
            kind: error.kind().as_str().to_string(),
            message: error.to_string(),
        }
    }
}

/// One queue entry at `_dlq/{id}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub id: String,
    pub timestamp: String,
    pub idempotency_key: String,
    pub operation: DlqOperation,
    pub error: DlqFailure,
    pub attempts: u32,
    pub status: DlqStatus,
    #[serde(default)]
    pub context: Value,
}

/// Listing filter; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct DlqFilter {
    pub verb: Option<String>,
    pub status: Option<DlqStatus>,
}

/// Aggregate statistics over the queue.
#[derive(Debug, Serialize)]
pub struct DlqStats {
    pub total: usize,
    pub by_status: BTreeMap<String, usize>,
    pub by_verb: BTreeMap<String, usize>,
}

/// The dead-letter queue over one store.
pub struct DeadLetterQueue<'a> {
    store: &'a Store,
    validator: &'a SchemaValidator,
}

impl<'a> DeadLetterQueue<'a> {
    pub fn new(store: &'a Store, validator: &'a SchemaValidator) -> Self {
        Self { store, validator }
    }

    /// Quarantine a failed operation. A duplicate add (same canonical
    /// operation shape) collapses into the existing entry: its attempt
    /// counter grows, the latest failure is recorded, and a previously
    /// resolved entry re-enters `failed`.
    pub fn add(
        &self,
        operation: DlqOperation,
        error: &ForgeFlowError,
        context: Value,
    ) -> Result<DlqEntry, ForgeFlowError> {
        let key =
            hash::operation_idempotency_key(&operation.verb, &operation.params, &operation.resource);
        let id = format!("dlq-{}", &key[..16]);

        let entry = match self.try_get(&id)? {
            Some(mut existing) => {
                existing.attempts += 1;
                existing.status = DlqStatus::Failed;
                existing.error = DlqFailure::from_error(error);
                existing
            }
            None => DlqEntry {
                id: id.clone(),
                timestamp: time::now_rfc3339(),
                idempotency_key: key,
                operation,
                error: DlqFailure::from_error(error),
                attempts: 1,
                status: DlqStatus::Failed,
                context,
            },
        };

        self.persist(&entry)?;
        AuditChain::new(self.store).append(json!({
            "op": "dlq.add",
            "dlq_id": entry.id,
            "verb": entry.operation.verb,
            "attempts": entry.attempts,
            "error_kind": entry.error.kind,
        }))?;
        Ok(entry)
    }

    pub fn get(&self, id: &str) -> Result<DlqEntry, ForgeFlowError> {
        self.try_get(id)?.ok_or_else(|| {
            ForgeFlowError::fault(ErrorKind::NotFound, format!("dlq entry '{}' not found", id))
        })
    }

    /// All entries matching the filter, oldest first.
    pub fn list(&self, filter: &DlqFilter) -> Result<Vec<DlqEntry>, ForgeFlowError> {
        let dir = self.store.dlq_dir();
        let mut entries = Vec::new();
        if dir.is_dir() {
            for dirent in std::fs::read_dir(&dir)? {
                let path = dirent?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match fsio::read_json::<DlqEntry>(&path) {
                    Ok(entry) => {
                        if filter
                            .verb
                            .as_ref()
                            .map(|v| &entry.operation.verb == v)
                            .unwrap_or(true)
                            && filter.status.map(|s| entry.status == s).unwrap_or(true)
                        {
                            entries.push(entry);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping malformed dlq entry");
                    }
                }
            }
        }
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id)));
        Ok(entries)
    }

    /// Remove an entry outright (operator action).
    pub fn delete(&self, id: &str) -> Result<(), ForgeFlowError> {
        let path = self.store.dlq_path(id);
        if !path.exists() {
            return Err(ForgeFlowError::fault(
                ErrorKind::NotFound,
                format!("dlq entry '{}' not found", id),
            ));
        }
        std::fs::remove_file(&path)?;
        AuditChain::new(self.store).append(json!({
            "op": "dlq.delete",
            "dlq_id": id,
        }))?;
        Ok(())
    }

    /// Replay one entry through `executor`. The entry is marked
    /// `in_progress` for the duration; success resolves it, failure returns
    /// it to `failed` with the attempt counted. Replaying a resolved entry
    /// is a no-op returning the terminal state.
    pub fn replay<F>(&self, id: &str, executor: F) -> Result<DlqEntry, ForgeFlowError>
    where
        F: FnOnce(&DlqOperation, &Value) -> Result<Value, ForgeFlowError>,
    {
        let mut entry = self.get(id)?;
        if entry.status == DlqStatus::Resolved {
            return Ok(entry);
        }

        entry.status = DlqStatus::InProgress;
        self.persist(&entry)?;

        match executor(&entry.operation, &entry.context) {
            Ok(_) => {
                entry.status = DlqStatus::Resolved;
                self.persist(&entry)?;
                AuditChain::new(self.store).append(json!({
                    "op": "dlq.replay",
                    "dlq_id": entry.id,
                    "outcome": "resolved",
                }))?;
            }
            Err(replay_error) => {
                entry.status = DlqStatus::Failed;
                entry.attempts += 1;
                entry.error = DlqFailure::from_error(&replay_error);
                self.persist(&entry)?;
                AuditChain::new(self.store).append(json!({
                    "op": "dlq.replay",
                    "dlq_id": entry.id,
                    "outcome": "failed",
                    "error_kind": entry.error.kind,
                }))?;
            }
        }
        Ok(entry)
    }

    /// Replay up to `batch_size` entries matching the filter, one at a time.
    /// Returns the post-replay entries in processing order.
    pub fn replay_batch<F>(
        &self,
        filter: &DlqFilter,
        mut executor: F,
        batch_size: usize,
    ) -> Result<Vec<DlqEntry>, ForgeFlowError>
    where
        F: FnMut(&DlqOperation, &Value) -> Result<Value, ForgeFlowError>,
    {
        let candidates = self.list(filter)?;
        let mut processed = Vec::new();
        for entry in candidates.into_iter().take(batch_size) {
            processed.push(self.replay(&entry.id, &mut executor)?);
        }
        Ok(processed)
    }

    /// Aggregate counts by status and verb.
    pub fn stats(&self) -> Result<DlqStats, ForgeFlowError> {
        let entries = self.list(&DlqFilter::default())?;
        let mut by_status: BTreeMap<String, usize> = BTreeMap::new();
        let mut by_verb: BTreeMap<String, usize> = BTreeMap::new();
        for entry in &entries {
            let status = serde_json::to_value(entry.status)?
                .as_str()
                .unwrap_or("unknown")
                .to_string();
            *by_status.entry(status).or_default() += 1;
            *by_verb.entry(entry.operation.verb.clone()).or_default() += 1;
        }
        Ok(DlqStats {
            total: entries.len(),
            by_status,
            by_verb,
        })
    }

    fn try_get(&self, id: &str) -> Result<Option<DlqEntry>, ForgeFlowError> {
        let path = self.store.dlq_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fsio::read_json(&path)?))
    }

    fn persist(&self, entry: &DlqEntry) -> Result<(), ForgeFlowError> {
        let doc = serde_json::to_value(entry)?;
        self.validator.validate_or_throw(&doc, DLQ_SCHEMA_NAME)?;
        let target = format!("_dlq/{}.json", entry.id);
        wal::atomic_write_json(self.store, &target, &doc, &entry.id)?;
        Ok(())
    }
}
