//! Approval gate repository. Gates are evaluated in `position` order.

use rusqlite::{params, Connection, Row};

use super::{json_column, to_json_text, DatabaseError};
use crate::model::ApprovalGate;

fn gate_from_row(row: &Row<'_>) -> Result<ApprovalGate, rusqlite::Error> {
    Ok(ApprovalGate {
        name: row.get("name")?,
        operation_pattern: row.get("operation_pattern")?,
        entity_types: json_column(row, "entity_types")?,
        requires_approval: row.get("requires_approval")?,
        auto_approve_conditions: json_column(row, "auto_approve_conditions")?,
        active: row.get("active")?,
    })
}

/// Inserts or replaces a gate at the given position.
pub fn upsert(conn: &Connection, gate: &ApprovalGate, position: u32) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO approval_gates (name, position, operation_pattern, entity_types,
         requires_approval, auto_approve_conditions, active)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
         ON CONFLICT(name) DO UPDATE SET position = excluded.position,
           operation_pattern = excluded.operation_pattern,
           entity_types = excluded.entity_types,
           requires_approval = excluded.requires_approval,
           auto_approve_conditions = excluded.auto_approve_conditions,
           active = excluded.active",
        params![
            gate.name,
            position,
            gate.operation_pattern,
            to_json_text(&gate.entity_types)?,
            gate.requires_approval,
            to_json_text(&gate.auto_approve_conditions)?,
            gate.active,
        ],
    )?;
    Ok(())
}

/// Active gates in evaluation order.
pub fn list_active(conn: &Connection) -> Result<Vec<ApprovalGate>, DatabaseError> {
    let mut stmt = conn
        .prepare("SELECT * FROM approval_gates WHERE active = 1 ORDER BY position ASC, name ASC")?;
    let rows = stmt
        .query_map([], gate_from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn count(conn: &Connection) -> Result<u32, DatabaseError> {
    let n = conn.query_row("SELECT COUNT(*) FROM approval_gates", [], |r| r.get(0))?;
    Ok(n)
}

/// Stores `gates` only when the table is empty, so operator edits survive
/// restarts. Returns true when the gates were written.
pub fn seed_if_empty(conn: &Connection, gates: &[ApprovalGate]) -> Result<bool, DatabaseError> {
    if count(conn)? > 0 {
        return Ok(false);
    }
    for (position, gate) in gates.iter().enumerate() {
        upsert(conn, gate, position as u32)?;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;
    use crate::model::{AutoApproveCondition, EntityType};

    fn gate(name: &str, pattern: &str) -> ApprovalGate {
        ApprovalGate {
            name: name.to_string(),
            operation_pattern: pattern.to_string(),
            entity_types: vec![EntityType::Job],
            requires_approval: true,
            auto_approve_conditions: vec![AutoApproveCondition::DataCheck {
                fields: vec!["source_ref".to_string()],
            }],
            active: true,
        }
    }

    #[test]
    fn test_seed_keeps_order_and_is_one_shot() {
        let db = Database::open_in_memory().unwrap();
        let gates = vec![gate("b_first", "merge"), gate("a_second", "recover")];
        assert!(db.with_conn(|c| seed_if_empty(c, &gates)).unwrap());
        assert!(!db.with_conn(|c| seed_if_empty(c, &[gate("x", "y")])).unwrap());

        let loaded = db.with_conn(list_active).unwrap();
        assert_eq!(loaded, gates);
    }

    #[test]
    fn test_inactive_gates_are_skipped() {
        let db = Database::open_in_memory().unwrap();
        let mut off = gate("off", "merge");
        off.active = false;
        db.with_conn(|c| {
            upsert(c, &off, 0)?;
            upsert(c, &gate("on", "merge"), 1)
        })
        .unwrap();
        let loaded = db.with_conn(list_active).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].name, "on");
        assert_eq!(db.with_conn(count).unwrap(), 2);
    }
}
