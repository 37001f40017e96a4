//! Audit log of state transitions applied through approved frames.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use serde_json::Value;

use super::{json_column, to_json_text, DatabaseError};
use crate::model::EntityRef;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionRow {
    pub id: String,
    pub frame_id: String,
    pub target: EntityRef,
    pub operation: String,
    pub before_state: Value,
    pub after_state: Value,
    pub created_at: DateTime<Utc>,
}

impl TransitionRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            frame_id: row.get("frame_id")?,
            target: EntityRef::new(row.get("entity_type")?, row.get::<_, String>("entity_id")?),
            operation: row.get("operation")?,
            before_state: json_column(row, "before_state")?,
            after_state: json_column(row, "after_state")?,
            created_at: row.get("created_at")?,
        })
    }
}

pub fn insert(conn: &Connection, t: &TransitionRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO state_transitions (id, frame_id, entity_type, entity_id, operation,
         before_state, after_state, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            t.id,
            t.frame_id,
            t.target.entity_type,
            t.target.id,
            t.operation,
            to_json_text(&t.before_state)?,
            to_json_text(&t.after_state)?,
            t.created_at,
        ],
    )?;
    Ok(())
}

pub fn list_for_entity(
    conn: &Connection,
    target: &EntityRef,
) -> Result<Vec<TransitionRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM state_transitions WHERE entity_type = ?1 AND entity_id = ?2
         ORDER BY created_at ASC, rowid ASC",
    )?;
    let rows = stmt
        .query_map(params![target.entity_type, target.id], TransitionRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::frame_repo::{self, tests::pending_frame};
    use crate::db::job_repo::tests::t0;
    use crate::db::Database;
    use serde_json::json;

    #[test]
    fn test_insert_and_list() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|c| {
            frame_repo::insert(c, &pending_frame("f1", t0()))?;
            insert(
                c,
                &TransitionRow {
                    id: "t1".to_string(),
                    frame_id: "f1".to_string(),
                    target: EntityRef::job("j"),
                    operation: "mark_failed".to_string(),
                    before_state: json!({"status": "processing"}),
                    after_state: json!({"status": "failed"}),
                    created_at: t0(),
                },
            )
        })
        .unwrap();

        let rows = db
            .with_conn(|c| list_for_entity(c, &EntityRef::job("j")))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].after_state["status"], "failed");
    }

    #[test]
    fn test_transition_requires_existing_frame() {
        let db = Database::open_in_memory().unwrap();
        let result = db.with_conn(|c| {
            insert(
                c,
                &TransitionRow {
                    id: "t1".to_string(),
                    frame_id: "missing".to_string(),
                    target: EntityRef::job("j"),
                    operation: "merge".to_string(),
                    before_state: Value::Null,
                    after_state: Value::Null,
                    created_at: t0(),
                },
            )
        });
        assert!(result.is_err());
    }
}
