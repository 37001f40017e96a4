//! Execution frame repository.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;
use serde_json::Value;

use super::violation_repo::ViolationRow;
use super::{json_column, to_json_text, DatabaseError};
use crate::model::{ApprovalStatus, EntityRef, FrameType};

/// One governed state transition and its approval lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameRow {
    pub id: String,
    pub frame_type: FrameType,
    pub initiator: String,
    pub target: EntityRef,
    pub operation: String,
    /// Opaque proposed new state.
    pub proposed_state: Value,
    pub approval_status: ApprovalStatus,
    pub requires_approval: bool,
    pub auto_approved: bool,
    pub gate_name: Option<String>,
    /// Violations found when the frame was created.
    pub violations: Vec<ViolationRow>,
    pub executed: bool,
    pub executed_at: Option<DateTime<Utc>>,
    pub approved_by: Option<String>,
    pub approved_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    /// Free-form annotation; never branched on.
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl FrameRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            frame_type: row.get("frame_type")?,
            initiator: row.get("initiator")?,
            target: EntityRef::new(row.get("entity_type")?, row.get::<_, String>("entity_id")?),
            operation: row.get("operation")?,
            proposed_state: json_column(row, "proposed_state")?,
            approval_status: row.get("approval_status")?,
            requires_approval: row.get("requires_approval")?,
            auto_approved: row.get("auto_approved")?,
            gate_name: row.get("gate_name")?,
            violations: json_column(row, "violations")?,
            executed: row.get("executed")?,
            executed_at: row.get("executed_at")?,
            approved_by: row.get("approved_by")?,
            approved_at: row.get("approved_at")?,
            notes: row.get("notes")?,
            metadata: json_column(row, "metadata")?,
            created_at: row.get("created_at")?,
            expires_at: row.get("expires_at")?,
        })
    }
}

pub fn insert(conn: &Connection, frame: &FrameRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO execution_frames (id, frame_type, initiator, entity_type, entity_id,
         operation, proposed_state, approval_status, requires_approval, auto_approved,
         gate_name, violations, executed, executed_at, approved_by, approved_at, notes,
         metadata, created_at, expires_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
         ?18, ?19, ?20)",
        params![
            frame.id,
            frame.frame_type,
            frame.initiator,
            frame.target.entity_type,
            frame.target.id,
            frame.operation,
            to_json_text(&frame.proposed_state)?,
            frame.approval_status,
            frame.requires_approval,
            frame.auto_approved,
            frame.gate_name,
            to_json_text(&frame.violations)?,
            frame.executed,
            frame.executed_at,
            frame.approved_by,
            frame.approved_at,
            frame.notes,
            to_json_text(&frame.metadata)?,
            frame.created_at,
            frame.expires_at,
        ],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<FrameRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM execution_frames WHERE id = ?1",
            params![id],
            FrameRow::from_row,
        )
        .optional()?;
    Ok(row)
}

pub fn list_for_entity(
    conn: &Connection,
    target: &EntityRef,
) -> Result<Vec<FrameRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM execution_frames WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY created_at ASC",
    )?;
    let rows = stmt
        .query_map(params![target.entity_type, target.id], FrameRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_pending(conn: &Connection) -> Result<Vec<FrameRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM execution_frames WHERE approval_status = 'pending' ORDER BY created_at ASC",
    )?;
    let rows = stmt
        .query_map([], FrameRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Applies a human decision to a pending frame. Approval sets `executed`;
/// rejection never does. Returns false if the frame was no longer pending.
pub fn decide(
    conn: &Connection,
    id: &str,
    status: ApprovalStatus,
    approver: &str,
    notes: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let executed = status == ApprovalStatus::Approved;
    let executed_at = executed.then_some(now);
    let changed = conn.execute(
        "UPDATE execution_frames SET approval_status = ?2, approved_by = ?3, approved_at = ?4,
         notes = ?5, executed = ?6, executed_at = ?7
         WHERE id = ?1 AND approval_status = 'pending'",
        params![id, status, approver, now, notes, executed, executed_at],
    )?;
    Ok(changed == 1)
}

/// Moves a single pending frame to `expired`.
pub fn mark_expired(conn: &Connection, id: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE execution_frames SET approval_status = 'expired'
         WHERE id = ?1 AND approval_status = 'pending'",
        params![id],
    )?;
    Ok(changed == 1)
}

/// Expires every pending frame whose window closed before `now`.
pub fn expire_due(conn: &Connection, now: DateTime<Utc>) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE execution_frames SET approval_status = 'expired'
         WHERE approval_status = 'pending' AND expires_at < ?1",
        params![now],
    )?;
    Ok(changed)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::job_repo::tests::t0;
    use crate::db::Database;
    use serde_json::json;

    pub(crate) fn pending_frame(id: &str, created_at: DateTime<Utc>) -> FrameRow {
        FrameRow {
            id: id.to_string(),
            frame_type: FrameType::AiExecution,
            initiator: "worker-1".to_string(),
            target: EntityRef::job("j"),
            operation: "mark_failed".to_string(),
            proposed_state: json!({"status": "failed"}),
            approval_status: ApprovalStatus::Pending,
            requires_approval: true,
            auto_approved: false,
            gate_name: Some("failure_marking".to_string()),
            violations: vec![],
            executed: false,
            executed_at: None,
            approved_by: None,
            approved_at: None,
            notes: None,
            metadata: json!({}),
            created_at,
            expires_at: created_at + chrono::Duration::hours(1),
        }
    }

    #[test]
    fn test_insert_and_find() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|c| insert(c, &pending_frame("f1", t0()))).unwrap();
        let found = db.with_conn(|c| find_by_id(c, "f1")).unwrap().unwrap();
        assert_eq!(found, pending_frame("f1", t0()));
    }

    #[test]
    fn test_decide_only_applies_to_pending() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|c| insert(c, &pending_frame("f1", t0()))).unwrap();
        assert!(db
            .with_conn(|c| decide(c, "f1", ApprovalStatus::Approved, "alice", None, t0()))
            .unwrap());
        assert!(!db
            .with_conn(|c| decide(c, "f1", ApprovalStatus::Rejected, "bob", None, t0()))
            .unwrap());

        let found = db.with_conn(|c| find_by_id(c, "f1")).unwrap().unwrap();
        assert_eq!(found.approval_status, ApprovalStatus::Approved);
        assert!(found.executed);
        assert_eq!(found.approved_by.as_deref(), Some("alice"));
    }

    #[test]
    fn test_rejection_never_executes() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|c| insert(c, &pending_frame("f1", t0()))).unwrap();
        db.with_conn(|c| decide(c, "f1", ApprovalStatus::Rejected, "bob", Some("no"), t0()))
            .unwrap();
        let found = db.with_conn(|c| find_by_id(c, "f1")).unwrap().unwrap();
        assert!(!found.executed);
        assert_eq!(found.notes.as_deref(), Some("no"));
    }

    #[test]
    fn test_expire_due() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|c| {
            insert(c, &pending_frame("old", t0()))?;
            insert(c, &pending_frame("new", t0() + chrono::Duration::minutes(50)))?;
            Ok(())
        })
        .unwrap();
        let expired = db
            .with_conn(|c| expire_due(c, t0() + chrono::Duration::minutes(61)))
            .unwrap();
        assert_eq!(expired, 1);
        assert_eq!(db.with_conn(list_pending).unwrap().len(), 1);
        let old = db.with_conn(|c| find_by_id(c, "old")).unwrap().unwrap();
        assert_eq!(old.approval_status, ApprovalStatus::Expired);
    }
}
