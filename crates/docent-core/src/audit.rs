//! Append-only audit records.
//!
//! Every run writes its decision stages into one record; the record is
//! the sole source for replaying what happened. Steps only ever append,
//! and a final status is absorbing. Creation failures are fatal to the
//! run; later write failures degrade to a logged `false` so the flow
//! keeps moving.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::warn;
use uuid::Uuid;

use docent_shared::{QueryRequest, QuestionBody, ResponseBody, RouteInfo};

/// Audit backend errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum AuditError {
    #[error("audit backend error: {0}")]
    Backend(String),
}

/// Record lifecycle. `Running` is initial; the rest are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditStatus {
    Running,
    Completed,
    CompletedNoAnswer,
    Failed,
}

impl AuditStatus {
    pub fn is_final(self) -> bool {
        !matches!(self, AuditStatus::Running)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuditStatus::Running => "running",
            AuditStatus::Completed => "completed",
            AuditStatus::CompletedNoAnswer => "completed_no_answer",
            AuditStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One decision-stage entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepEntry {
    pub step_name: String,
    pub timestamp: DateTime<Utc>,
    pub data: serde_json::Value,
}

/// The full record for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: String,
    pub community_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    pub skip_enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub route: Option<RouteInfo>,
    pub question: QuestionBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    pub status: AuditStatus,
    pub current_step: String,
    pub steps: Vec<StepEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseBody>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AuditRecord {
    fn from_request(request: &QueryRequest) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            community_id: request.community_id.clone(),
            session_id: request.session_id.clone(),
            skip_enabled: request.skip_enabled,
            route: request.route.clone(),
            question: request.question_body(),
            metadata: request.metadata.clone(),
            status: AuditStatus::Running,
            current_step: "initialized".to_string(),
            steps: Vec::new(),
            response: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Apply one step append in place; false when it would regress.
    fn apply_step(&mut self, step_name: &str, data: serde_json::Value, status: AuditStatus) -> bool {
        if self.status.is_final() && status != self.status {
            return false;
        }
        let now = Utc::now();
        self.steps.push(StepEntry {
            step_name: step_name.to_string(),
            timestamp: now,
            data,
        });
        self.current_step = step_name.to_string();
        self.status = status;
        self.updated_at = now;
        true
    }

    /// Apply finalization in place; false when it would regress.
    fn apply_finalize(&mut self, message: Option<&str>, status: AuditStatus) -> bool {
        if !status.is_final() || self.status.is_final() {
            return false;
        }
        if let Some(message) = message {
            self.response = Some(ResponseBody {
                message: message.to_string(),
            });
        }
        self.status = status;
        self.updated_at = Utc::now();
        true
    }
}

// ============================================================================
// Audit Store Trait
// ============================================================================

/// Persistence seam for audit records.
pub trait AuditStore: Send + Sync {
    /// Open a record for the request. Failure here is fatal to the run;
    /// nothing may execute unrecorded.
    fn create(&self, request: &QueryRequest) -> Result<String, AuditError>;

    /// Append one step and set the running status. `false` means the
    /// write was lost or refused; callers log and continue.
    fn append_step(
        &self,
        record_id: &str,
        step_name: &str,
        data: serde_json::Value,
        status: AuditStatus,
    ) -> bool;

    /// Close the record with a final status and an optional response
    /// message. Leaves `steps` and `current_step` untouched.
    fn finalize(&self, record_id: &str, message: Option<&str>, status: AuditStatus) -> bool;

    /// `None` on unknown id or backend failure.
    fn read(&self, record_id: &str) -> Option<AuditRecord>;
}

fn lock_unpoisoned<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// In-memory store
// ============================================================================

/// Map-backed store for tests and embedded use.
#[derive(Default)]
pub struct InMemoryAuditStore {
    records: Mutex<HashMap<String, AuditRecord>>,
}

impl InMemoryAuditStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every record held, newest-insertion order not guaranteed.
    pub fn records(&self) -> Vec<AuditRecord> {
        lock_unpoisoned(&self.records).values().cloned().collect()
    }
}

impl AuditStore for InMemoryAuditStore {
    fn create(&self, request: &QueryRequest) -> Result<String, AuditError> {
        let record = AuditRecord::from_request(request);
        let id = record.id.clone();
        lock_unpoisoned(&self.records).insert(id.clone(), record);
        Ok(id)
    }

    fn append_step(
        &self,
        record_id: &str,
        step_name: &str,
        data: serde_json::Value,
        status: AuditStatus,
    ) -> bool {
        let mut records = lock_unpoisoned(&self.records);
        match records.get_mut(record_id) {
            Some(record) => record.apply_step(step_name, data, status),
            None => false,
        }
    }

    fn finalize(&self, record_id: &str, message: Option<&str>, status: AuditStatus) -> bool {
        let mut records = lock_unpoisoned(&self.records);
        match records.get_mut(record_id) {
            Some(record) => record.apply_finalize(message, status),
            None => false,
        }
    }

    fn read(&self, record_id: &str) -> Option<AuditRecord> {
        lock_unpoisoned(&self.records).get(record_id).cloned()
    }
}

/// Store whose every operation fails; exercises the fatal create path.
pub struct FailingAuditStore;

impl AuditStore for FailingAuditStore {
    fn create(&self, _request: &QueryRequest) -> Result<String, AuditError> {
        Err(AuditError::Backend("store offline".to_string()))
    }

    fn append_step(
        &self,
        _record_id: &str,
        _step_name: &str,
        _data: serde_json::Value,
        _status: AuditStatus,
    ) -> bool {
        false
    }

    fn finalize(&self, _record_id: &str, _message: Option<&str>, _status: AuditStatus) -> bool {
        false
    }

    fn read(&self, _record_id: &str) -> Option<AuditRecord> {
        None
    }
}

// ============================================================================
// SQLite store
// ============================================================================

const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS audit_records (
  id TEXT PRIMARY KEY,
  community_id TEXT NOT NULL,
  status TEXT NOT NULL CHECK (status IN ('running','completed','completed_no_answer','failed')),
  doc TEXT NOT NULL,
  created_at TEXT NOT NULL,
  updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_audit_records_community
  ON audit_records(community_id, created_at);
";

/// Single-file durable store.
///
/// The record is kept as one JSON document per row, the way the previous
/// store generation kept them; community and status are mirrored into
/// columns for querying.
pub struct SqliteAuditStore {
    conn: Mutex<Connection>,
}

impl SqliteAuditStore {
    pub fn open(path: &Path) -> Result<Self, AuditError> {
        let conn = Connection::open(path)
            .map_err(|e| AuditError::Backend(format!("open {}: {}", path.display(), e)))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| AuditError::Backend(format!("schema: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Private database for tests.
    pub fn open_in_memory() -> Result<Self, AuditError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AuditError::Backend(format!("open in-memory: {}", e)))?;
        conn.execute_batch(SCHEMA)
            .map_err(|e| AuditError::Backend(format!("schema: {}", e)))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn load(conn: &Connection, record_id: &str) -> Option<AuditRecord> {
        let doc: Option<String> = conn
            .query_row(
                "SELECT doc FROM audit_records WHERE id = ?1",
                params![record_id],
                |row| row.get(0),
            )
            .optional()
            .ok()
            .flatten();
        let doc = doc?;
        match serde_json::from_str(&doc) {
            Ok(record) => Some(record),
            Err(e) => {
                warn!("[audit] record {} is unreadable: {}", record_id, e);
                None
            }
        }
    }

    fn persist(conn: &Connection, record: &AuditRecord) -> Result<(), AuditError> {
        let doc = serde_json::to_string(record)
            .map_err(|e| AuditError::Backend(format!("serialize: {}", e)))?;
        conn.execute(
            "INSERT INTO audit_records (id, community_id, status, doc, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(id) DO UPDATE SET
               status = excluded.status,
               doc = excluded.doc,
               updated_at = excluded.updated_at",
            params![
                record.id,
                record.community_id,
                record.status.as_str(),
                doc,
                record.created_at.to_rfc3339(),
                record.updated_at.to_rfc3339(),
            ],
        )
        .map_err(|e| AuditError::Backend(format!("write: {}", e)))?;
        Ok(())
    }

    fn mutate<F>(&self, record_id: &str, op: F) -> bool
    where
        F: FnOnce(&mut AuditRecord) -> bool,
    {
        let conn = lock_unpoisoned(&self.conn);
        let Some(mut record) = Self::load(&conn, record_id) else {
            return false;
        };
        if !op(&mut record) {
            return false;
        }
        match Self::persist(&conn, &record) {
            Ok(()) => true,
            Err(e) => {
                warn!("[audit] write for record {} lost: {}", record_id, e);
                false
            }
        }
    }
}

impl AuditStore for SqliteAuditStore {
    fn create(&self, request: &QueryRequest) -> Result<String, AuditError> {
        let record = AuditRecord::from_request(request);
        let conn = lock_unpoisoned(&self.conn);
        Self::persist(&conn, &record)?;
        Ok(record.id)
    }

    fn append_step(
        &self,
        record_id: &str,
        step_name: &str,
        data: serde_json::Value,
        status: AuditStatus,
    ) -> bool {
        self.mutate(record_id, |record| record.apply_step(step_name, data, status))
    }

    fn finalize(&self, record_id: &str, message: Option<&str>, status: AuditStatus) -> bool {
        self.mutate(record_id, |record| record.apply_finalize(message, status))
    }

    fn read(&self, record_id: &str) -> Option<AuditRecord> {
        let conn = lock_unpoisoned(&self.conn);
        Self::load(&conn, record_id)
    }
}

// ============================================================================
// Bound trail handle
// ============================================================================

/// A store bound to one record id, passed down the pipeline so stages
/// never see store-plus-id plumbing.
#[derive(Clone)]
pub struct AuditTrail {
    store: Arc<dyn AuditStore>,
    record_id: String,
}

impl AuditTrail {
    pub fn bind(store: Arc<dyn AuditStore>, record_id: String) -> Self {
        Self { store, record_id }
    }

    pub fn record_id(&self) -> &str {
        &self.record_id
    }

    /// Append a step, keeping the record running. A lost write is logged
    /// and swallowed; the flow never stops for it.
    pub fn step(&self, step_name: &str, data: serde_json::Value) {
        if !self
            .store
            .append_step(&self.record_id, step_name, data, AuditStatus::Running)
        {
            warn!(
                "[audit] step '{}' lost for record {}",
                step_name, self.record_id
            );
        }
    }

    /// Close the record. Same degradation contract as `step`.
    pub fn finalize(&self, message: Option<&str>, status: AuditStatus) {
        if !self.store.finalize(&self.record_id, message, status) {
            warn!(
                "[audit] finalize ({}) lost for record {}",
                status, self.record_id
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request() -> QueryRequest {
        QueryRequest::new("c1", "where are the docs?").with_session("s1")
    }

    fn exercise_contract(store: &dyn AuditStore) {
        let id = store.create(&request()).unwrap();

        let record = store.read(&id).unwrap();
        assert_eq!(record.status, AuditStatus::Running);
        assert_eq!(record.current_step, "initialized");
        assert_eq!(record.community_id, "c1");
        assert_eq!(record.question.message, "where are the docs?");
        assert!(record.steps.is_empty());

        assert!(store.append_step(&id, "statement_check", json!({"question": true}), AuditStatus::Running));
        assert!(store.append_step(&id, "route_selected", json!({"strategy": "retrieval"}), AuditStatus::Running));

        let record = store.read(&id).unwrap();
        assert_eq!(record.steps.len(), 2);
        assert_eq!(record.steps[0].step_name, "statement_check");
        assert_eq!(record.steps[1].step_name, "route_selected");
        assert_eq!(record.current_step, "route_selected");

        assert!(store.finalize(&id, Some("in #resources"), AuditStatus::Completed));
        let record = store.read(&id).unwrap();
        assert_eq!(record.status, AuditStatus::Completed);
        assert_eq!(record.response.as_ref().unwrap().message, "in #resources");
        // Finalize leaves the step trail alone.
        assert_eq!(record.current_step, "route_selected");
        assert_eq!(record.steps.len(), 2);

        // Final status is absorbing.
        assert!(!store.append_step(&id, "late", json!({}), AuditStatus::Running));
        assert!(!store.finalize(&id, None, AuditStatus::Failed));
        let record = store.read(&id).unwrap();
        assert_eq!(record.status, AuditStatus::Completed);
        assert_eq!(record.steps.len(), 2);

        // Unknown ids degrade, never panic.
        assert!(!store.append_step("nope", "x", json!({}), AuditStatus::Running));
        assert!(!store.finalize("nope", None, AuditStatus::Failed));
        assert!(store.read("nope").is_none());
    }

    #[test]
    fn test_in_memory_store_contract() {
        exercise_contract(&InMemoryAuditStore::new());
    }

    #[test]
    fn test_sqlite_store_contract() {
        exercise_contract(&SqliteAuditStore::open_in_memory().unwrap());
    }

    #[test]
    fn test_sqlite_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.db");

        let id = {
            let store = SqliteAuditStore::open(&path).unwrap();
            let id = store.create(&request()).unwrap();
            assert!(store.append_step(&id, "route_selected", json!({}), AuditStatus::Running));
            assert!(store.finalize(&id, Some("done"), AuditStatus::Completed));
            id
        };

        let store = SqliteAuditStore::open(&path).unwrap();
        let record = store.read(&id).unwrap();
        assert_eq!(record.status, AuditStatus::Completed);
        assert_eq!(record.steps.len(), 1);
        assert_eq!(record.response.as_ref().unwrap().message, "done");
    }

    #[test]
    fn test_finalize_requires_final_status() {
        let store = InMemoryAuditStore::new();
        let id = store.create(&request()).unwrap();
        assert!(!store.finalize(&id, None, AuditStatus::Running));
        assert_eq!(store.read(&id).unwrap().status, AuditStatus::Running);
    }

    #[test]
    fn test_failing_store() {
        let store = FailingAuditStore;
        assert!(store.create(&request()).is_err());
        assert!(!store.append_step("x", "s", json!({}), AuditStatus::Running));
        assert!(store.read("x").is_none());
    }

    #[test]
    fn test_trail_swallows_lost_writes() {
        let trail = AuditTrail::bind(Arc::new(FailingAuditStore), "gone".to_string());
        // Neither call may panic or error out.
        trail.step("statement_check", json!({}));
        trail.finalize(None, AuditStatus::Failed);
    }

    #[test]
    fn test_record_serializes_camel_case() {
        let store = InMemoryAuditStore::new();
        let id = store.create(&request()).unwrap();
        store.append_step(&id, "rag_check", json!({"score": 0.8}), AuditStatus::Running);
        let v = serde_json::to_value(store.read(&id).unwrap()).unwrap();
        assert_eq!(v["communityId"], "c1");
        assert_eq!(v["currentStep"], "rag_check");
        assert_eq!(v["steps"][0]["stepName"], "rag_check");
        assert_eq!(v["status"], "running");
    }
}
