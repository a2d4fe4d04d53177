//! Store abstraction for ForgeFlow's durable state.
//!
//! A [`Store`] is the single path authority for the on-disk layout. Every
//! subsystem resolves its files through these accessors; nothing else in the
//! crate builds store paths by hand.
//!
//! Layout relative to the root:
//!
//! ```text
//! _wal/transaction.lock        _wal/pending_writes.jsonl
//! _wal_shadow/pending_writes.jsonl
//! audit.jsonl                  events_ledger.jsonl
//! status/seq.json              status/health.json
//! maps/{id}.json               context/map_index_with_triggers.json
//! context/hot_index.json       _schema/{name}.schema.json
//! _dlq/{id}.json               runs/{id}.json
//! _incidents/{id}.json         _archive/...
//! ```

use crate::core::error::ForgeFlowError;
use std::fs;
use std::path::{Path, PathBuf};

/// Handle to a ForgeFlow store root.
///
/// The WAL pair, audit log, ledger, indexes, and document directories are
/// process-wide resources: shared read, exclusive write under the
/// transaction lock (see `core::lock`).
#[derive(Debug, Clone)]
pub struct Store {
    root: PathBuf,
}

impl Store {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn lock_path(&self) -> PathBuf {
        self.root.join("_wal").join("transaction.lock")
    }

    pub fn wal_path(&self) -> PathBuf {
        self.root.join("_wal").join("pending_writes.jsonl")
    }

    pub fn wal_shadow_path(&self) -> PathBuf {
        self.root.join("_wal_shadow").join("pending_writes.jsonl")
    }

    pub fn audit_path(&self) -> PathBuf {
        self.root.join("audit.jsonl")
    }

    pub fn ledger_path(&self) -> PathBuf {
        self.root.join("events_ledger.jsonl")
    }

    pub fn seq_path(&self) -> PathBuf {
        self.root.join("status").join("seq.json")
    }

    pub fn health_path(&self) -> PathBuf {
        self.root.join("status").join("health.json")
    }

    pub fn maps_dir(&self) -> PathBuf {
        self.root.join("maps")
    }

    pub fn map_path(&self, id: &str) -> PathBuf {
        self.maps_dir().join(format!("{}.json", id))
    }

    pub fn map_index_path(&self) -> PathBuf {
        self.root.join("context").join("map_index_with_triggers.json")
    }

    pub fn hot_index_path(&self) -> PathBuf {
        self.root.join("context").join("hot_index.json")
    }

    pub fn schema_dir(&self) -> PathBuf {
        self.root.join("_schema")
    }

    pub fn schema_path(&self, name: &str) -> PathBuf {
        self.schema_dir().join(format!("{}.schema.json", name))
    }

    pub fn dlq_dir(&self) -> PathBuf {
        self.root.join("_dlq")
    }

    pub fn dlq_path(&self, id: &str) -> PathBuf {
        self.dlq_dir().join(format!("{}.json", id))
    }

    pub fn runs_dir(&self) -> PathBuf {
        self.root.join("runs")
    }

    pub fn run_path(&self, id: &str) -> PathBuf {
        self.runs_dir().join(format!("{}.json", id))
    }

    pub fn incidents_dir(&self) -> PathBuf {
        self.root.join("_incidents")
    }

    pub fn incident_path(&self, id: &str) -> PathBuf {
        self.incidents_dir().join(format!("{}.json", id))
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.root.join("_archive")
    }

    /// Create the full directory tree. Idempotent.
    pub fn ensure_layout(&self) -> Result<(), ForgeFlowError> {
        for dir in [
            self.root.join("_wal"),
            self.root.join("_wal_shadow"),
            self.root.join("status"),
            self.maps_dir(),
            self.root.join("context"),
            self.schema_dir(),
            self.dlq_dir(),
            self.runs_dir(),
            self.incidents_dir(),
            self.archive_dir(),
        ] {
            fs::create_dir_all(&dir)?;
        }
        Ok(())
    }

    /// Resolve a target path relative to the root, for WAL intents recorded
    /// as relative paths.
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    /// Express `path` relative to the root, if it lives under it.
    pub fn relativize(&self, path: &Path) -> Option<String> {
        path.strip_prefix(&self.root)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_paths() {
        let store = Store::new("/tmp/ff");
        assert_eq!(
            store.lock_path(),
            PathBuf::from("/tmp/ff/_wal/transaction.lock")
        );
        assert_eq!(
            store.wal_shadow_path(),
            PathBuf::from("/tmp/ff/_wal_shadow/pending_writes.jsonl")
        );
        assert_eq!(store.map_path("auth-flow"), PathBuf::from("/tmp/ff/maps/auth-flow.json"));
        assert_eq!(
            store.schema_path("map"),
            PathBuf::from("/tmp/ff/_schema/map.schema.json")
        );
    }

    #[test]
    fn test_ensure_layout_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let store = Store::new(tmp.path());
        store.ensure_layout().unwrap();
        store.ensure_layout().unwrap();
        assert!(store.maps_dir().is_dir());
        assert!(store.schema_dir().is_dir());
        assert!(store.archive_dir().is_dir());
    }

    #[test]
    fn test_relativize_round_trip() {
        let store = Store::new("/tmp/ff");
        let abs = store.map_path("auth-flow");
        let rel = store.relativize(&abs).unwrap();
        assert_eq!(rel, "maps/auth-flow.json");
        assert_eq!(store.resolve(&rel), abs);
        assert!(store.relativize(Path::new("/elsewhere/x.json")).is_none());
    }
}
