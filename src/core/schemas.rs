// src/core/schemas.rs
// Centralized document schema definitions and validation for ForgeFlow.
//
// The `_schema/` directory on disk is the source of truth: schemas are seeded
// from the constants below when absent, and operator edits win thereafter.
// Every repository write validates against its named schema before any byte
// reaches the store.

use crate::core::error::{ErrorKind, ForgeFlowError};
use crate::core::fsio;
use crate::core::store::Store;
use rustc_hash::FxHashMap;
use serde_json::Value;
use std::fs;

pub const MAP_SCHEMA_NAME: &str = "map";
pub const RUN_SCHEMA_NAME: &str = "run";
pub const INCIDENT_SCHEMA_NAME: &str = "incident";
pub const DLQ_SCHEMA_NAME: &str = "dlq";

/// Kebab-case map id pattern, shared by the schema and the repository's
/// pre-flight check.
pub const MAP_ID_PATTERN: &str = "^[a-z0-9]+(-[a-z0-9]+)*$";

const MAP_SCHEMA: &str = r##"{
    "$schema": "https://json-schema.org/draft/2020-12/schema",
    "title": "map",
    "type": "object",
    "required": ["id", "status", "created_at", "updated_at"],
    "properties": {
        "id": { "type": "string", "pattern": "^[a-z0-9]+(-[a-z0-9]+)*$" },
        "status": { "enum": ["draft", "active", "archived", "deleted"] },
        "created_at": { "type": "string" },
        "updated_at": { "type": "string" },
        "tags": { "type": "array", "items": { "type": "string" } },
        "version": { "type": "integer", "minimum": 1 },
        "playbook_required": { "type": "boolean" }
    }
}"##;

const RUN_SCHEMA: &str = r##"{
    "$schema": "https://json-schema.org/draft/2020-12/schema",
    "title": "run",
    "type": "object",
    "required": ["id", "state", "started_at", "payload", "notes"],
    "properties": {
        "id": { "type": "string", "pattern": "^run-[0-9]+-[0-9a-f]{8}$" },
        "state": { "enum": ["executing", "succeeded", "failed", "partially_succeeded"] },
        "started_at": { "type": "string" },
        "finished_at": { "type": "string" },
        "duration_ms": { "type": "integer", "minimum": 0 },
        "payload": {},
        "notes": { "type": "array", "items": { "type": "string" } }
    }
}"##;

const INCIDENT_SCHEMA: &str = r##"{
    "$schema": "https://json-schema.org/draft/2020-12/schema",
    "title": "incident",
    "type": "object",
    "required": ["id", "status", "severity", "summary", "started_at", "notes", "related_maps"],
    "properties": {
        "id": { "type": "string", "pattern": "^incident-[0-9]+-[0-9a-f]{8}$" },
        "status": { "enum": ["open", "resolved"] },
        "severity": { "enum": ["low", "medium", "high", "critical"] },
        "summary": { "type": "string", "minLength": 1 },
        "started_at": { "type": "string" },
        "resolved_at": { "type": "string" },
        "notes": { "type": "array", "items": { "type": "string" } },
        "rca": { "type": "string" },
        "related_maps": { "type": "array", "items": { "type": "string" } }
    }
}"##;

const DLQ_SCHEMA: &str = r##"{
    "$schema": "https://json-schema.org/draft/2020-12/schema",
    "title": "dlq",
    "type": "object",
    "required": ["id", "timestamp", "idempotency_key", "operation", "error", "attempts", "status"],
    "properties": {
        "id": { "type": "string" },
        "timestamp": { "type": "string" },
        "idempotency_key": { "type": "string", "pattern": "^[0-9a-f]{64}$" },
        "operation": {
            "type": "object",
            "required": ["verb", "params", "resource"],
            "properties": {
                "verb": { "type": "string", "minLength": 1 },
                "params": {},
                "resource": { "type": "string" }
            }
        },
        "error": {
            "type": "object",
            "required": ["kind", "message"],
            "properties": {
                "kind": { "type": "string" },
                "message": { "type": "string" }
            }
        },
        "attempts": { "type": "integer", "minimum": 1 },
        "status": { "enum": ["failed", "in_progress", "resolved"] },
        "context": {}
    }
}"##;

/// Seed the default schema documents into `_schema/` when absent. Existing
/// files are left untouched so operator edits survive restarts.
pub fn ensure_default_schemas(store: &Store) -> Result<(), ForgeFlowError> {
    for (name, body) in [
        (MAP_SCHEMA_NAME, MAP_SCHEMA),
        (RUN_SCHEMA_NAME, RUN_SCHEMA),
        (INCIDENT_SCHEMA_NAME, INCIDENT_SCHEMA),
        (DLQ_SCHEMA_NAME, DLQ_SCHEMA),
    ] {
        let path = store.schema_path(name);
        if !path.exists() {
            let doc: Value = serde_json::from_str(body)?;
            fsio::write_json_atomic(&path, &doc)?;
        }
    }
    Ok(())
}

/// Result of validating one document.
#[derive(Debug)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub errors: Vec<String>,
}

/// Compiled-schema registry over the store's `_schema/` directory.
///
/// Schemas compile once at construction, keyed by filename stem
/// (`map.schema.json` → `map`).
#[derive(Debug)]
pub struct SchemaValidator {
    validators: FxHashMap<String, jsonschema::Validator>,
}

impl SchemaValidator {
    /// Compile every `*.schema.json` under the schema directory.
    pub fn load(store: &Store) -> Result<Self, ForgeFlowError> {
        let mut validators = FxHashMap::default();
        let dir = store.schema_dir();
        if dir.is_dir() {
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                    continue;
                };
                let Some(stem) = file_name.strip_suffix(".schema.json") else {
                    continue;
                };
                let doc: Value = fsio::read_json(&path)?;
                let compiled = jsonschema::validator_for(&doc).map_err(|e| {
                    ForgeFlowError::fault(
                        ErrorKind::SchemaInvalid,
                        format!("schema '{}' does not compile: {}", stem, e),
                    )
                })?;
                validators.insert(stem.to_string(), compiled);
            }
        }
        Ok(Self { validators })
    }

    pub fn known_schemas(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.validators.keys().map(String::as_str).collect();
        names.sort();
        names
    }

    /// Validate `doc` against the named schema.
    pub fn validate(&self, doc: &Value, schema_name: &str) -> Result<ValidationOutcome, ForgeFlowError> {
        let validator = self.validators.get(schema_name).ok_or_else(|| {
            ForgeFlowError::fault(
                ErrorKind::SchemaInvalid,
                format!("unknown schema '{}'", schema_name),
            )
        })?;
        let errors: Vec<String> = validator
            .iter_errors(doc)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{}: {}", path, e)
                }
            })
            .collect();
        Ok(ValidationOutcome {
            valid: errors.is_empty(),
            errors,
        })
    }

    /// Validate and fail with `SCHEMA_INVALID` carrying the error list.
    pub fn validate_or_throw(&self, doc: &Value, schema_name: &str) -> Result<(), ForgeFlowError> {
        let outcome = self.validate(doc, schema_name)?;
        if !outcome.valid {
            return Err(ForgeFlowError::fault(
                ErrorKind::SchemaInvalid,
                format!(
                    "document fails schema '{}': {}",
                    schema_name,
                    outcome.errors.join("; ")
                ),
            ));
        }
        Ok(())
    }
}
