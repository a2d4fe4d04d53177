//! Run lifecycle: bounded, lock-holding units of work.
//!
//! A run owns every mutation it makes: `start` mints the id, takes the
//! transaction lock under that id, and persists the run document; `finish`
//! stamps the outcome and releases the lock. Because runs span processes
//! (a CLI invocation per step), ownership lives in the lock record, not in a
//! guard scope; each step re-verifies that the on-disk owner is still this
//! run before mutating.

use crate::core::audit::AuditChain;
use crate::core::cancel::CancelToken;
use crate::core::config::CoreConfig;
use crate::core::error::{ErrorKind, ForgeFlowError};
use crate::core::fsio;
use crate::core::health::{Guard, HealthMesh};
use crate::core::ledger::EventLedger;
use crate::core::lock::TransactionLock;
use crate::core::schemas::{RUN_SCHEMA_NAME, SchemaValidator};
use crate::core::store::Store;
use crate::core::time;
use crate::core::wal;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::time::Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Executing,
    Succeeded,
    Failed,
    PartiallySucceeded,
}

impl RunState {
    pub fn terminal(self) -> bool {
        self != Self::Executing
    }
}

/// The run document at `runs/{id}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunRecord {
    pub id: String,
    pub state: RunState,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub payload: Value,
    pub notes: Vec<String>,
}

/// Run operations over one store.
pub struct Runs<'a> {
    store: &'a Store,
    validator: &'a SchemaValidator,
    mesh: &'a HealthMesh,
    config: &'a CoreConfig,
}

impl<'a> Runs<'a> {
    pub fn new(
        store: &'a Store,
        validator: &'a SchemaValidator,
        mesh: &'a HealthMesh,
        config: &'a CoreConfig,
    ) -> Self {
        Self {
            store,
            validator,
            mesh,
            config,
        }
    }

    fn lock(&self) -> TransactionLock {
        TransactionLock::with_settings(
            self.store,
            Duration::from_millis(self.config.lock_poll_ms),
            self.config.stale_lock_secs,
        )
    }

    /// Start a run: mint the id, acquire the transaction lock under it,
    /// persist and record the start. The lock stays held on disk until
    /// `finish`.
    pub fn start(
        &self,
        payload: Value,
        max_wait: Duration,
        cancel: &CancelToken,
    ) -> Result<RunRecord, ForgeFlowError> {
        Guard::new(self.mesh).enforce_safe_mode()?;

        let id = time::new_run_id();
        let guard = self.lock().acquire(&id, max_wait, cancel)?;

        let record = RunRecord {
            id: id.clone(),
            state: RunState::Executing,
            started_at: time::now_rfc3339(),
            finished_at: None,
            duration_ms: None,
            payload,
            notes: Vec::new(),
        };
        // Any failure from here unwinds through the guard and releases.
        self.persist(&record)?;
        self.record_event(&record, "run.start")?;
        guard.detach();
        Ok(record)
    }

    /// Append a note to an executing run. The caller must still own the
    /// transaction lock under this run's id.
    pub fn note(&self, id: &str, content: &str) -> Result<RunRecord, ForgeFlowError> {
        self.lock().verify_owner(id)?;
        let mut record = self.read(id)?;
        if record.state.terminal() {
            return Err(ForgeFlowError::fault(
                ErrorKind::OperationFailed,
                format!("run '{}' already finished as {:?}", id, record.state),
            ));
        }
        record.notes.push(content.to_string());
        self.persist(&record)?;
        AuditChain::new(self.store).append(json!({
            "op": "run.note",
            "run_id": id,
            "note": content,
        }))?;
        Ok(record)
    }

    /// Finish a run with a terminal outcome, record it, and release the
    /// lock. Finishing an already-terminal run fails; the lock must still be
    /// owned by this run.
    pub fn finish(&self, id: &str, outcome: RunState) -> Result<RunRecord, ForgeFlowError> {
        if !outcome.terminal() {
            return Err(ForgeFlowError::fault(
                ErrorKind::OperationFailed,
                "a run can only finish in a terminal state",
            ));
        }
        let lock = self.lock();
        lock.verify_owner(id)?;

        let mut record = self.read(id)?;
        if record.state.terminal() {
            return Err(ForgeFlowError::fault(
                ErrorKind::OperationFailed,
                format!("run '{}' already finished as {:?}", id, record.state),
            ));
        }

        let finished_at = time::now_rfc3339();
        let duration_ms = time::parse_rfc3339(&record.started_at)
            .zip(time::parse_rfc3339(&finished_at))
            .map(|(start, end)| (end - start).num_milliseconds().max(0) as u64);
        record.state = outcome;
        record.finished_at = Some(finished_at);
        record.duration_ms = duration_ms;

        self.persist(&record)?;
        self.record_event(&record, "run.finish")?;
        lock.release_if_owner(id)?;
        Ok(record)
    }

    /// Load a run document.
    pub fn read(&self, id: &str) -> Result<RunRecord, ForgeFlowError> {
        let path = self.store.run_path(id);
        if !path.exists() {
            return Err(ForgeFlowError::fault(
                ErrorKind::NotFound,
                format!("run '{}' not found", id),
            ));
        }
        fsio::read_json(&path)
    }

    /// List all run documents, newest first by id.
    pub fn list(&self) -> Result<Vec<RunRecord>, ForgeFlowError> {
        let dir = self.store.runs_dir();
        let mut runs = Vec::new();
        if dir.is_dir() {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match fsio::read_json::<RunRecord>(&path) {
                    Ok(run) => runs.push(run),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping malformed run document");
                    }
                }
            }
        }
        runs.sort_by(|a, b| b.id.cmp(&a.id));
        Ok(runs)
    }

    fn persist(&self, record: &RunRecord) -> Result<(), ForgeFlowError> {
        let doc = serde_json::to_value(record)?;
        self.validator.validate_or_throw(&doc, RUN_SCHEMA_NAME)?;
        let target = format!("runs/{}.json", record.id);
        wal::atomic_write_json(self.store, &target, &doc, &record.id)?;
        Ok(())
    }

    fn record_event(&self, record: &RunRecord, op: &str) -> Result<(), ForgeFlowError> {
        let event = json!({
            "op": op,
            "run_id": record.id,
            "state": record.state,
        });
        AuditChain::new(self.store).append(event.clone())?;
        EventLedger::new(self.store).append(&time::new_event_id(), event, "runs")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schemas;
    use tempfile::tempdir;

    struct Fixture {
        _tmp: tempfile::TempDir,
        store: Store,
        validator: SchemaValidator,
        mesh: HealthMesh,
        config: CoreConfig,
    }

    fn fixture() -> Fixture {
        let tmp = tempdir().unwrap();
        let store = Store::new(tmp.path());
        store.ensure_layout().unwrap();
        schemas::ensure_default_schemas(&store).unwrap();
        let validator = SchemaValidator::load(&store).unwrap();
        let mesh = HealthMesh::with_cache_ttl(&store, Duration::from_secs(0));
        let mut config = CoreConfig::default();
        config.lock_poll_ms = 10;
        Fixture {
            _tmp: tmp,
            store,
            validator,
            mesh,
            config,
        }
    }

    impl Fixture {
        fn runs(&self) -> Runs<'_> {
            Runs::new(&self.store, &self.validator, &self.mesh, &self.config)
        }
    }

    #[test]
    fn test_start_holds_the_lock_under_the_run_id() {
        let f = fixture();
        let cancel = CancelToken::new();
        let run = f
            .runs()
            .start(json!({"goal": "sync"}), Duration::from_secs(1), &cancel)
            .unwrap();
        assert_eq!(run.state, RunState::Executing);

        let lock = TransactionLock::new(&f.store);
        let record = lock.read_record().unwrap().unwrap();
        assert!(record.locked);
        assert_eq!(record.owner, run.id);
    }

    #[test]
    fn test_full_lifecycle_releases_lock_and_stamps_duration() {
        let f = fixture();
        let cancel = CancelToken::new();
        let runs = f.runs();
        let run = runs
            .start(json!({}), Duration::from_secs(1), &cancel)
            .unwrap();
        runs.note(&run.id, "halfway").unwrap();
        let finished = runs.finish(&run.id, RunState::Succeeded).unwrap();

        assert_eq!(finished.state, RunState::Succeeded);
        assert!(finished.finished_at.is_some());
        assert!(finished.duration_ms.is_some());
        assert_eq!(finished.notes, vec!["halfway".to_string()]);

        let lock = TransactionLock::new(&f.store);
        assert!(!lock.read_record().unwrap().unwrap().locked);
    }

    #[test]
    fn test_finish_twice_is_rejected() {
        let f = fixture();
        let cancel = CancelToken::new();
        let runs = f.runs();
        let run = runs
            .start(json!({}), Duration::from_secs(1), &cancel)
            .unwrap();
        runs.finish(&run.id, RunState::Failed).unwrap();
        let err = runs.finish(&run.id, RunState::Succeeded).unwrap_err();
        // Lock already released: the owner check fails first.
        assert_eq!(err.kind(), ErrorKind::LockTimeout);
    }

    #[test]
    fn test_note_requires_lock_ownership() {
        let f = fixture();
        let err = f.runs().note("run-0-00000000", "orphan note").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockTimeout);
    }

    #[test]
    fn test_start_is_refused_in_safe_mode() {
        let f = fixture();
        for _ in 0..3 {
            f.mesh.record_failure("backend down").unwrap();
        }
        let cancel = CancelToken::new();
        let err = f
            .runs()
            .start(json!({}), Duration::from_secs(1), &cancel)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::CircuitBreakerOpen);
    }

    #[test]
    fn test_second_run_waits_for_first() {
        let f = fixture();
        let cancel = CancelToken::new();
        let runs = f.runs();
        let first = runs
            .start(json!({}), Duration::from_secs(1), &cancel)
            .unwrap();
        let err = runs
            .start(json!({}), Duration::from_millis(50), &cancel)
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockTimeout);
        runs.finish(&first.id, RunState::Succeeded).unwrap();
        let second = runs
            .start(json!({}), Duration::from_secs(1), &cancel)
            .unwrap();
        runs.finish(&second.id, RunState::PartiallySucceeded)
            .unwrap();
    }

    #[test]
    fn test_start_and_finish_are_audited_and_ledgered() {
        let f = fixture();
        let cancel = CancelToken::new();
        let runs = f.runs();
        let run = runs
            .start(json!({}), Duration::from_secs(1), &cancel)
            .unwrap();
        runs.finish(&run.id, RunState::Succeeded).unwrap();

        let chain = AuditChain::new(&f.store);
        let ops: Vec<String> = chain
            .entries()
            .unwrap()
            .iter()
            .map(|e| e.event["op"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(ops, vec!["run.start", "run.finish"]);
        assert!(chain.verify().unwrap().intact());

        let ledger = EventLedger::new(&f.store);
        let entries = ledger.entries().unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.target_scope == "runs"));
    }
}
