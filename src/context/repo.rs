//! The context repository: schema-gated CRUD over map documents.
//!
//! Maps are small JSON records at `maps/{id}.json`, validated against the
//! `map` schema on every write. Upserts flow through the journaled atomic
//! writer under the transaction lock, then refresh the map index and the hot
//! index and append to the audit chain. Reads are lock-free and count into
//! the hot index; listing tolerates malformed files with a warning instead
//! of failing the scan.

use crate::context::hot::HotIndex;
use crate::context::score::{MapScore, ScoreHint, ScoreInput, score_map};
use crate::core::audit::AuditChain;
use crate::core::error::{ErrorKind, ForgeFlowError};
use crate::core::fsio;
use crate::core::health::{Guard, HealthMesh};
use crate::core::lock::TransactionLock;
use crate::core::schemas::{MAP_ID_PATTERN, MAP_SCHEMA_NAME, SchemaValidator};
use crate::core::store::Store;
use crate::core::time;
use crate::core::wal;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MapStatus {
    Draft,
    Active,
    Archived,
    Deleted,
}

/// Stable metadata extracted from one map document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MapMetadata {
    pub id: String,
    pub status: MapStatus,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: String,
    pub updated_at: String,
    #[serde(default)]
    pub playbook_required: bool,
}

/// The map index document, rewritten atomically on every upsert.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MapIndexDoc {
    pub maps: Vec<MapMetadata>,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub version: u64,
}

/// Listing filter; `None` fields match everything.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub status: Option<MapStatus>,
    pub tag: Option<String>,
}

/// A scored map, as returned by [`MapRepository::top_maps`].
#[derive(Debug, Clone, Serialize)]
pub struct ScoredMap {
    pub id: String,
    pub score: MapScore,
    pub metadata: MapMetadata,
}

/// Map CRUD over one store.
pub struct MapRepository<'a> {
    store: &'a Store,
    validator: &'a SchemaValidator,
    mesh: &'a HealthMesh,
}

impl<'a> MapRepository<'a> {
    pub fn new(store: &'a Store, validator: &'a SchemaValidator, mesh: &'a HealthMesh) -> Self {
        Self {
            store,
            validator,
            mesh,
        }
    }

    /// Create or update a map. The caller must hold the transaction lock
    /// under `run_id`; `created_at` is preserved across updates and
    /// `updated_at` is stamped here.
    pub fn upsert(&self, id: &str, data: Value, run_id: &str) -> Result<Value, ForgeFlowError> {
        validate_map_id(id)?;
        Guard::new(self.mesh).enforce_safe_mode()?;
        TransactionLock::new(self.store).verify_owner(run_id)?;

        let mut doc = match data {
            Value::Object(fields) => fields,
            _ => {
                return Err(ForgeFlowError::fault(
                    ErrorKind::SchemaInvalid,
                    "map payload must be a JSON object",
                ));
            }
        };

        let now = time::now_rfc3339();
        let existing_created_at = self
            .read_raw(id)
            .ok()
            .flatten()
            .and_then(|old| old.get("created_at").and_then(Value::as_str).map(String::from));

        doc.insert("id".to_string(), json!(id));
        doc.insert(
            "created_at".to_string(),
            json!(existing_created_at.unwrap_or_else(|| now.clone())),
        );
        doc.insert("updated_at".to_string(), json!(now));
        doc.entry("status".to_string())
            .or_insert_with(|| json!("draft"));

        let doc = Value::Object(doc);
        self.validator.validate_or_throw(&doc, MAP_SCHEMA_NAME)?;

        let target = format!("maps/{}.json", id);
        wal::atomic_write_json(self.store, &target, &doc, run_id)?;

        self.refresh_index(&doc)?;
        if let Err(e) = HotIndex::new(self.store).touch(id) {
            tracing::warn!(map_id = id, error = %e, "hot index update failed");
        }
        AuditChain::new(self.store).append(json!({
            "op": "map.upsert",
            "map_id": id,
            "run_id": run_id,
            "status": doc["status"],
        }))?;
        Ok(doc)
    }

    /// Logically delete a map by rewriting it with `status = "deleted"`.
    pub fn delete(&self, id: &str, run_id: &str) -> Result<Value, ForgeFlowError> {
        let mut doc = self.read_raw(id)?.ok_or_else(|| {
            ForgeFlowError::fault(ErrorKind::NotFound, format!("map '{}' not found", id))
        })?;
        if let Some(fields) = doc.as_object_mut() {
            fields.insert("status".to_string(), json!("deleted"));
        }
        self.upsert(id, doc, run_id)
    }

    /// Read a map and count the access into the hot index.
    pub fn read(&self, id: &str) -> Result<Value, ForgeFlowError> {
        validate_map_id(id)?;
        let doc = self.read_raw(id)?.ok_or_else(|| {
            ForgeFlowError::fault(ErrorKind::NotFound, format!("map '{}' not found", id))
        })?;
        if let Err(e) = HotIndex::new(self.store).touch(id) {
            tracing::warn!(map_id = id, error = %e, "hot index update failed");
        }
        Ok(doc)
    }

    /// Scan `maps/*.json` and return metadata for every parseable map that
    /// matches the filter. Malformed files are skipped with a warning.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<MapMetadata>, ForgeFlowError> {
        let dir = self.store.maps_dir();
        let mut maps = Vec::new();
        if dir.is_dir() {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match fsio::read_json::<MapMetadata>(&path) {
                    Ok(metadata) => {
                        if filter
                            .status
                            .map(|wanted| metadata.status == wanted)
                            .unwrap_or(true)
                            && filter
                                .tag
                                .as_ref()
                                .map(|t| metadata.tags.iter().any(|tag| tag == t))
                                .unwrap_or(true)
                        {
                            maps.push(metadata);
                        }
                    }
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping malformed map document");
                    }
                }
            }
        }
        maps.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(maps)
    }

    /// Score every map against `hint` and return the top `limit`, ordered by
    /// total score, then newest `updated_at`, then id.
    pub fn top_maps(&self, hint: &ScoreHint, limit: usize) -> Result<Vec<ScoredMap>, ForgeFlowError> {
        let now = chrono::Utc::now();
        let mut scored: Vec<ScoredMap> = self
            .list(&ListFilter::default())?
            .into_iter()
            .map(|metadata| {
                let input = ScoreInput {
                    id: metadata.id.clone(),
                    tags: metadata.tags.clone(),
                    updated_at: Some(metadata.updated_at.clone()),
                    created_at: Some(metadata.created_at.clone()),
                    playbook_required: metadata.playbook_required,
                };
                ScoredMap {
                    id: metadata.id.clone(),
                    score: score_map(&input, hint, now),
                    metadata,
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .total
                .partial_cmp(&a.score.total)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| b.metadata.updated_at.cmp(&a.metadata.updated_at))
                .then_with(|| a.id.cmp(&b.id))
        });
        scored.truncate(limit);
        Ok(scored)
    }

    fn read_raw(&self, id: &str) -> Result<Option<Value>, ForgeFlowError> {
        let path = self.store.map_path(id);
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fsio::read_json(&path)?))
    }

    fn refresh_index(&self, doc: &Value) -> Result<(), ForgeFlowError> {
        let metadata: MapMetadata = serde_json::from_value(doc.clone())?;
        let path = self.store.map_index_path();
        let mut index: MapIndexDoc = if path.exists() {
            fsio::read_json(&path)?
        } else {
            MapIndexDoc::default()
        };
        index.maps.retain(|m| m.id != metadata.id);
        index.maps.push(metadata);
        index.maps.sort_by(|a, b| a.id.cmp(&b.id));
        index.updated_at = time::now_rfc3339();
        index.version += 1;
        fsio::write_json_atomic(&path, &index)
    }
}

fn validate_map_id(id: &str) -> Result<(), ForgeFlowError> {
    // Compiled per call; map ids are short and this sits on the slow path of
    // a disk write.
    let pattern = Regex::new(MAP_ID_PATTERN).map_err(|e| {
        ForgeFlowError::fault(ErrorKind::OperationFailed, format!("bad id pattern: {}", e))
    })?;
    if !pattern.is_match(id) {
        return Err(ForgeFlowError::fault(
            ErrorKind::SchemaInvalid,
            format!("map id '{}' is not kebab-case", id),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cancel::CancelToken;
    use crate::core::schemas;
    use std::time::Duration;
    use tempfile::tempdir;

    struct Fixture {
        _tmp: tempfile::TempDir,
        store: Store,
        validator: SchemaValidator,
        mesh: HealthMesh,
    }

    fn fixture() -> Fixture {
        let tmp = tempdir().unwrap();
        let store = Store::new(tmp.path());
        store.ensure_layout().unwrap();
        schemas::ensure_default_schemas(&store).unwrap();
        let validator = SchemaValidator::load(&store).unwrap();
        let mesh = HealthMesh::with_cache_ttl(&store, Duration::from_secs(0));
        Fixture {
            _tmp: tmp,
            store,
            validator,
            mesh,
        }
    }

    impl Fixture {
        fn repo(&self) -> MapRepository<'_> {
            MapRepository::new(&self.store, &self.validator, &self.mesh)
        }

        /// Take the transaction lock as `run_id` for the test's duration.
        fn hold_lock(&self, run_id: &str) -> crate::core::lock::LockGuard {
            TransactionLock::new(&self.store)
                .acquire(run_id, Duration::from_secs(1), &CancelToken::new())
                .unwrap()
        }
    }

    #[test]
    fn test_upsert_creates_validated_document() {
        let f = fixture();
        let _guard = f.hold_lock("run-1");
        let doc = f
            .repo()
            .upsert("auth-flow", json!({"tags": ["auth"], "status": "active"}), "run-1")
            .unwrap();
        assert_eq!(doc["id"], "auth-flow");
        assert_eq!(doc["status"], "active");
        assert!(doc["created_at"].is_string());
        assert!(f.store.map_path("auth-flow").exists());
    }

    #[test]
    fn test_upsert_preserves_created_at() {
        let f = fixture();
        let _guard = f.hold_lock("run-1");
        let repo = f.repo();
        let first = repo.upsert("auth-flow", json!({}), "run-1").unwrap();
        std::thread::sleep(Duration::from_millis(5));
        let second = repo
            .upsert("auth-flow", json!({"status": "active"}), "run-1")
            .unwrap();
        assert_eq!(first["created_at"], second["created_at"]);
        assert!(second["updated_at"].as_str() >= first["updated_at"].as_str());
    }

    #[test]
    fn test_upsert_requires_lock_ownership() {
        let f = fixture();
        let err = f.repo().upsert("auth-flow", json!({}), "run-1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockTimeout);
    }

    #[test]
    fn test_non_kebab_id_is_rejected_before_any_write() {
        let f = fixture();
        let err = f.repo().upsert("Not_Kebab", json!({}), "run-1").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaInvalid);
        assert!(!f.store.wal_path().exists() || std::fs::read(f.store.wal_path()).unwrap().is_empty());
    }

    #[test]
    fn test_invalid_status_fails_schema_gate() {
        let f = fixture();
        let _guard = f.hold_lock("run-1");
        let err = f
            .repo()
            .upsert("auth-flow", json!({"status": "limbo"}), "run-1")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaInvalid);
        assert!(!f.store.map_path("auth-flow").exists());
    }

    #[test]
    fn test_read_counts_into_hot_index() {
        let f = fixture();
        {
            let _guard = f.hold_lock("run-1");
            f.repo().upsert("auth-flow", json!({}), "run-1").unwrap();
        }
        f.repo().read("auth-flow").unwrap();
        f.repo().read("auth-flow").unwrap();
        let hot = HotIndex::new(&f.store).read().unwrap();
        let entry = hot.entries.iter().find(|e| e.map_id == "auth-flow").unwrap();
        // one touch from the upsert, two from the reads
        assert_eq!(entry.access_count, 3);
    }

    #[test]
    fn test_list_skips_malformed_files() {
        let f = fixture();
        {
            let _guard = f.hold_lock("run-1");
            f.repo()
                .upsert("good-map", json!({"status": "active"}), "run-1")
                .unwrap();
        }
        std::fs::write(f.store.maps_dir().join("broken.json"), "{ nope").unwrap();
        let maps = f.repo().list(&ListFilter::default()).unwrap();
        assert_eq!(maps.len(), 1);
        assert_eq!(maps[0].id, "good-map");
    }

    #[test]
    fn test_list_filters_by_status_and_tag() {
        let f = fixture();
        {
            let _guard = f.hold_lock("run-1");
            let repo = f.repo();
            repo.upsert("a-map", json!({"status": "active", "tags": ["auth"]}), "run-1")
                .unwrap();
            repo.upsert("b-map", json!({"status": "draft", "tags": ["billing"]}), "run-1")
                .unwrap();
        }
        let active = f
            .repo()
            .list(&ListFilter {
                status: Some(MapStatus::Active),
                tag: None,
            })
            .unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "a-map");

        let billing = f
            .repo()
            .list(&ListFilter {
                status: None,
                tag: Some("billing".to_string()),
            })
            .unwrap();
        assert_eq!(billing.len(), 1);
        assert_eq!(billing[0].id, "b-map");
    }

    #[test]
    fn test_delete_is_logical() {
        let f = fixture();
        let _guard = f.hold_lock("run-1");
        let repo = f.repo();
        repo.upsert("old-map", json!({"status": "active"}), "run-1")
            .unwrap();
        repo.delete("old-map", "run-1").unwrap();
        assert!(f.store.map_path("old-map").exists());
        let doc = repo.read("old-map").unwrap();
        assert_eq!(doc["status"], "deleted");
    }

    #[test]
    fn test_top_maps_orders_by_score() {
        let f = fixture();
        {
            let _guard = f.hold_lock("run-1");
            let repo = f.repo();
            repo.upsert(
                "boosted",
                json!({"status": "active", "tags": ["auth"], "playbook_required": true}),
                "run-1",
            )
            .unwrap();
            repo.upsert(
                "plain",
                json!({"status": "active", "tags": ["auth"]}),
                "run-1",
            )
            .unwrap();
            repo.upsert("unrelated", json!({"status": "active", "tags": ["billing"]}), "run-1")
                .unwrap();
        }
        let hint = ScoreHint {
            tags: vec!["auth".to_string()],
        };
        let top = f.repo().top_maps(&hint, 2).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].id, "boosted");
        assert_eq!(top[1].id, "plain");
        assert!(top[0].score.total > top[1].score.total);
        assert!(top.iter().all(|m| (0.0..=1.0).contains(&m.score.total)));
    }

    #[test]
    fn test_map_index_tracks_upserts() {
        let f = fixture();
        let _guard = f.hold_lock("run-1");
        let repo = f.repo();
        repo.upsert("a-map", json!({}), "run-1").unwrap();
        repo.upsert("b-map", json!({}), "run-1").unwrap();
        repo.upsert("a-map", json!({"status": "active"}), "run-1")
            .unwrap();
        let index: MapIndexDoc = fsio::read_json(&f.store.map_index_path()).unwrap();
        assert_eq!(index.maps.len(), 2);
        assert_eq!(index.version, 3);
        let a = index.maps.iter().find(|m| m.id == "a-map").unwrap();
        assert_eq!(a.status, MapStatus::Active);
    }
}
