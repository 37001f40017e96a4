//! Constraint violation repository.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::{json_column, to_json_text, DatabaseError};
use crate::model::{EntityRef, Severity};

/// A detected breach of a state rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationRow {
    pub id: String,
    /// Frame whose validation found the violation.
    pub frame_id: Option<String>,
    pub target: EntityRef,
    pub constraint_name: String,
    pub category: String,
    pub severity: Severity,
    pub message: String,
    pub expected_state: Value,
    pub actual_state: Value,
    pub resolved: bool,
    pub resolved_by: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ViolationRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            frame_id: row.get("frame_id")?,
            target: EntityRef::new(row.get("entity_type")?, row.get::<_, String>("entity_id")?),
            constraint_name: row.get("constraint_name")?,
            category: row.get("category")?,
            severity: row.get("severity")?,
            message: row.get("message")?,
            expected_state: json_column(row, "expected_state")?,
            actual_state: json_column(row, "actual_state")?,
            resolved: row.get("resolved")?,
            resolved_by: row.get("resolved_by")?,
            resolved_at: row.get("resolved_at")?,
            created_at: row.get("created_at")?,
        })
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

pub fn insert(conn: &Connection, v: &ViolationRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO constraint_violations (id, frame_id, entity_type, entity_id,
         constraint_name, category, severity, message, expected_state, actual_state,
         resolved, resolved_by, resolved_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            v.id,
            v.frame_id,
            v.target.entity_type,
            v.target.id,
            v.constraint_name,
            v.category,
            v.severity,
            v.message,
            to_json_text(&v.expected_state)?,
            to_json_text(&v.actual_state)?,
            v.resolved,
            v.resolved_by,
            v.resolved_at,
            v.created_at,
        ],
    )?;
    Ok(())
}

pub fn list_for_entity(
    conn: &Connection,
    target: &EntityRef,
) -> Result<Vec<ViolationRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM constraint_violations WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY created_at ASC",
    )?;
    let rows = stmt
        .query_map(params![target.entity_type, target.id], ViolationRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_unresolved(
    conn: &Connection,
    target: &EntityRef,
) -> Result<Vec<ViolationRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM constraint_violations
         WHERE entity_type = ?1 AND entity_id = ?2 AND resolved = 0
         ORDER BY created_at ASC",
    )?;
    let rows = stmt
        .query_map(params![target.entity_type, target.id], ViolationRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Marks every open violation on the entity resolved. Returns how many
/// changed.
pub fn resolve_for_entity(
    conn: &Connection,
    target: &EntityRef,
    resolver: &str,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE constraint_violations SET resolved = 1, resolved_by = ?3, resolved_at = ?4
         WHERE entity_type = ?1 AND entity_id = ?2 AND resolved = 0",
        params![target.entity_type, target.id, resolver, now],
    )?;
    Ok(changed)
}
