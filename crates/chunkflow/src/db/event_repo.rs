//! Transactional outbox for pipeline events.
//!
//! Events are appended in the same transaction as the state change they
//! describe and consumed at-least-once.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::Serialize;
use serde_json::Value;

use super::{to_json_text, DatabaseError};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutboxRow {
    pub id: i64,
    pub kind: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

pub fn append(
    conn: &Connection,
    kind: &str,
    payload: &Value,
    now: DateTime<Utc>,
) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO outbox_events (kind, payload, created_at) VALUES (?1, ?2, ?3)",
        params![kind, to_json_text(payload)?, now],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Unconsumed events, oldest first.
pub fn pending(conn: &Connection, limit: u32) -> Result<Vec<OutboxRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT id, kind, payload, created_at FROM outbox_events
         WHERE consumed_at IS NULL ORDER BY id ASC LIMIT ?1",
    )?;
    let rows = stmt
        .query_map(params![limit], |r| {
            Ok(OutboxRow {
                id: r.get(0)?,
                kind: r.get(1)?,
                payload: super::json_column(r, "payload")?,
                created_at: r.get(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Marks events consumed. Already-consumed ids are ignored.
pub fn ack(conn: &Connection, ids: &[i64], now: DateTime<Utc>) -> Result<usize, DatabaseError> {
    let mut stmt = conn.prepare(
        "UPDATE outbox_events SET consumed_at = ?2 WHERE id = ?1 AND consumed_at IS NULL",
    )?;
    let mut changed = 0;
    for id in ids {
        changed += stmt.execute(params![id, now])?;
    }
    Ok(changed)
}
