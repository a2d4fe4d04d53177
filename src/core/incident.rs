//! Incident lifecycle: durable records of operational events.
//!
//! Incidents parallel the run lifecycle but never hold the transaction lock:
//! they are observational records, safe to write while a run is in flight.
//! Each document still flows through the journaled atomic writer and is
//! audited and ledgered, attributed to the incident's own id.

use crate::core::audit::AuditChain;
use crate::core::error::{ErrorKind, ForgeFlowError};
use crate::core::fsio;
use crate::core::ledger::EventLedger;
use crate::core::schemas::{INCIDENT_SCHEMA_NAME, SchemaValidator};
use crate::core::store::Store;
use crate::core::time;
use crate::core::wal;
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IncidentStatus {
    Open,
    Resolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

/// The incident document at `_incidents/{id}.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncidentRecord {
    pub id: String,
    pub status: IncidentStatus,
    pub severity: Severity,
    pub summary: String,
    pub started_at: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<String>,
    pub notes: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rca: Option<String>,
    pub related_maps: Vec<String>,
}

/// Incident operations over one store.
pub struct Incidents<'a> {
    store: &'a Store,
    validator: &'a SchemaValidator,
}

impl<'a> Incidents<'a> {
    pub fn new(store: &'a Store, validator: &'a SchemaValidator) -> Self {
        Self { store, validator }
    }

    /// Open an incident and record the event.
    pub fn open(&self, severity: Severity, summary: &str) -> Result<IncidentRecord, ForgeFlowError> {
        if summary.trim().is_empty() {
            return Err(ForgeFlowError::fault(
                ErrorKind::SchemaInvalid,
                "incident summary must not be empty",
            ));
        }
        let record = IncidentRecord {
            id: time::new_incident_id(),
            status: IncidentStatus::Open,
            severity,
            summary: summary.to_string(),
            started_at: time::now_rfc3339(),
            resolved_at: None,
            notes: Vec::new(),
            rca: None,
            related_maps: Vec::new(),
        };
        self.persist(&record)?;
        self.record_event(&record, "incident.open")?;
        Ok(record)
    }

    /// Append a note.
    pub fn note(&self, id: &str, content: &str) -> Result<IncidentRecord, ForgeFlowError> {
        let mut record = self.read(id)?;
        record.notes.push(content.to_string());
        self.persist(&record)?;
        AuditChain::new(self.store).append(json!({
            "op": "incident.note",
            "incident_id": id,
            "note": content,
        }))?;
        Ok(record)
    }

    /// Link a context map to this incident. Duplicate links collapse.
    pub fn link_map(&self, id: &str, map_id: &str) -> Result<IncidentRecord, ForgeFlowError> {
        let mut record = self.read(id)?;
        if !record.related_maps.iter().any(|m| m == map_id) {
            record.related_maps.push(map_id.to_string());
            self.persist(&record)?;
            AuditChain::new(self.store).append(json!({
                "op": "incident.link_map",
                "incident_id": id,
                "map_id": map_id,
            }))?;
        }
        Ok(record)
    }

    /// Resolve an incident, optionally attaching a root-cause analysis.
    /// Resolution is terminal.
    pub fn resolve(&self, id: &str, rca: Option<&str>) -> Result<IncidentRecord, ForgeFlowError> {
        let mut record = self.read(id)?;
        if record.status == IncidentStatus::Resolved {
            return Err(ForgeFlowError::fault(
                ErrorKind::OperationFailed,
                format!("incident '{}' is already resolved", id),
            ));
        }
        record.status = IncidentStatus::Resolved;
        record.resolved_at = Some(time::now_rfc3339());
        record.rca = rca.map(str::to_string);
        self.persist(&record)?;
        self.record_event(&record, "incident.resolve")?;
        Ok(record)
    }

    pub fn read(&self, id: &str) -> Result<IncidentRecord, ForgeFlowError> {
        let path = self.store.incident_path(id);
        if !path.exists() {
            return Err(ForgeFlowError::fault(
                ErrorKind::NotFound,
                format!("incident '{}' not found", id),
            ));
        }
        fsio::read_json(&path)
    }

    /// All incidents, open first, then newest first by id.
    pub fn list(&self) -> Result<Vec<IncidentRecord>, ForgeFlowError> {
        let dir = self.store.incidents_dir();
        let mut incidents = Vec::new();
        if dir.is_dir() {
            for entry in std::fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                match fsio::read_json::<IncidentRecord>(&path) {
                    Ok(incident) => incidents.push(incident),
                    Err(e) => {
                        tracing::warn!(path = %path.display(), error = %e, "skipping malformed incident document");
                    }
                }
            }
        }
        incidents.sort_by(|a, b| {
            (a.status == IncidentStatus::Resolved)
                .cmp(&(b.status == IncidentStatus::Resolved))
                .then_with(|| b.id.cmp(&a.id))
        });
        Ok(incidents)
    }

    fn persist(&self, record: &IncidentRecord) -> Result<(), ForgeFlowError> {
        let doc = serde_json::to_value(record)?;
        self.validator
            .validate_or_throw(&doc, INCIDENT_SCHEMA_NAME)?;
        let target = format!("_incidents/{}.json", record.id);
        wal::atomic_write_json(self.store, &target, &doc, &record.id)?;
        Ok(())
    }

    fn record_event(&self, record: &IncidentRecord, op: &str) -> Result<(), ForgeFlowError> {
        let event = json!({
            "op": op,
            "incident_id": record.id,
            "status": record.status,
            "severity": record.severity,
        });
        AuditChain::new(self.store).append(event.clone())?;
        EventLedger::new(self.store).append(&time::new_event_id(), event, "incidents")?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::schemas;
    use tempfile::tempdir;

    fn fixture() -> (tempfile::TempDir, Store, SchemaValidator) {
        let tmp = tempdir().unwrap();
        let store = Store::new(tmp.path());
        store.ensure_layout().unwrap();
        schemas::ensure_default_schemas(&store).unwrap();
        let validator = SchemaValidator::load(&store).unwrap();
        (tmp, store, validator)
    }

    #[test]
    fn test_open_note_resolve() {
        let (_tmp, store, validator) = fixture();
        let incidents = Incidents::new(&store, &validator);
        let incident = incidents
            .open(Severity::High, "ledger append latency spike")
            .unwrap();
        assert_eq!(incident.status, IncidentStatus::Open);

        incidents.note(&incident.id, "correlated with provider outage").unwrap();
        let resolved = incidents
            .resolve(&incident.id, Some("provider rate limiting"))
            .unwrap();
        assert_eq!(resolved.status, IncidentStatus::Resolved);
        assert!(resolved.resolved_at.is_some());
        assert_eq!(resolved.rca.as_deref(), Some("provider rate limiting"));
    }

    #[test]
    fn test_resolve_is_terminal() {
        let (_tmp, store, validator) = fixture();
        let incidents = Incidents::new(&store, &validator);
        let incident = incidents.open(Severity::Low, "noise").unwrap();
        incidents.resolve(&incident.id, None).unwrap();
        let err = incidents.resolve(&incident.id, None).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OperationFailed);
    }

    #[test]
    fn test_incidents_do_not_touch_the_lock() {
        let (_tmp, store, validator) = fixture();
        let incidents = Incidents::new(&store, &validator);
        incidents.open(Severity::Medium, "observability gap").unwrap();
        // No lock record was ever created.
        assert!(!store.lock_path().exists());
    }

    #[test]
    fn test_link_map_collapses_duplicates() {
        let (_tmp, store, validator) = fixture();
        let incidents = Incidents::new(&store, &validator);
        let incident = incidents.open(Severity::Medium, "auth drift").unwrap();
        incidents.link_map(&incident.id, "auth-flow").unwrap();
        let linked = incidents.link_map(&incident.id, "auth-flow").unwrap();
        assert_eq!(linked.related_maps, vec!["auth-flow".to_string()]);
    }

    #[test]
    fn test_empty_summary_is_rejected() {
        let (_tmp, store, validator) = fixture();
        let incidents = Incidents::new(&store, &validator);
        let err = incidents.open(Severity::Low, "  ").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::SchemaInvalid);
    }
}
