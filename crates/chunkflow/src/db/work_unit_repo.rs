//! Work unit repository: the step queue.
//!
//! One row per attempt at running a step for a job or one of its chunks. The
//! partial unique index on live units makes enqueueing idempotent.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::DatabaseError;
use crate::model::{PipelineStep, WorkUnitStatus};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkUnitRow {
    pub id: String,
    pub job_id: String,
    /// `None` for job-level steps.
    pub chunk_id: Option<String>,
    pub step: PipelineStep,
    pub status: WorkUnitStatus,
    pub requires_approval: bool,
    pub approval_frame_id: Option<String>,
    pub retry_count: u32,
    pub unit_duration_seconds: Option<f64>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl WorkUnitRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            chunk_id: row.get("chunk_id")?,
            step: row.get("step")?,
            status: row.get("status")?,
            requires_approval: row.get("requires_approval")?,
            approval_frame_id: row.get("approval_frame_id")?,
            retry_count: row.get("retry_count")?,
            unit_duration_seconds: row.get("unit_duration_seconds")?,
            error: row.get("error")?,
            created_at: row.get("created_at")?,
            started_at: row.get("started_at")?,
            finished_at: row.get("finished_at")?,
        })
    }
}

/// Parameters for queueing a step attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct NewWorkUnit {
    pub job_id: String,
    pub chunk_id: Option<String>,
    pub step: PipelineStep,
    pub retry_count: u32,
    pub requires_approval: bool,
    pub unit_duration_seconds: Option<f64>,
}

/// Queues a unit. If a live unit already exists for the same
/// `(job, chunk, step)`, that unit is returned with `false`.
pub fn enqueue(
    conn: &Connection,
    unit: &NewWorkUnit,
    now: DateTime<Utc>,
) -> Result<(WorkUnitRow, bool), DatabaseError> {
    let id = uuid::Uuid::new_v4().to_string();
    let inserted = conn.execute(
        "INSERT INTO work_units (id, job_id, chunk_id, step, status, requires_approval,
         retry_count, unit_duration_seconds, created_at)
         VALUES (?1, ?2, ?3, ?4, 'pending', ?5, ?6, ?7, ?8)",
        params![
            id,
            unit.job_id,
            unit.chunk_id,
            unit.step,
            unit.requires_approval,
            unit.retry_count,
            unit.unit_duration_seconds,
            now
        ],
    );

    match inserted {
        Ok(_) => {
            let row = find_by_id(conn, &id)?.ok_or(DatabaseError::Sqlite(
                rusqlite::Error::QueryReturnedNoRows,
            ))?;
            Ok((row, true))
        }
        Err(e) => {
            let err = DatabaseError::Sqlite(e);
            if !err.is_unique_violation() {
                return Err(err);
            }
            let existing = find_live(conn, &unit.job_id, unit.chunk_id.as_deref(), unit.step)?
                .ok_or(err)?;
            Ok((existing, false))
        }
    }
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<WorkUnitRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM work_units WHERE id = ?1",
            params![id],
            WorkUnitRow::from_row,
        )
        .optional()?;
    Ok(row)
}

/// The pending or processing unit for `(job, chunk, step)`, if any.
pub fn find_live(
    conn: &Connection,
    job_id: &str,
    chunk_id: Option<&str>,
    step: PipelineStep,
) -> Result<Option<WorkUnitRow>, DatabaseError> {
    let row = conn
        .query_row(
            "SELECT * FROM work_units
             WHERE job_id = ?1 AND COALESCE(chunk_id, '') = COALESCE(?2, '') AND step = ?3
               AND status IN ('pending', 'processing')",
            params![job_id, chunk_id, step],
            WorkUnitRow::from_row,
        )
        .optional()?;
    Ok(row)
}

pub fn list_by_status(
    conn: &Connection,
    status: WorkUnitStatus,
) -> Result<Vec<WorkUnitRow>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT * FROM work_units WHERE status = ?1 ORDER BY created_at ASC")?;
    let rows = stmt
        .query_map(params![status], WorkUnitRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Live units of one job, oldest first.
pub fn list_live_by_job(
    conn: &Connection,
    job_id: &str,
) -> Result<Vec<WorkUnitRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM work_units WHERE job_id = ?1 AND status IN ('pending', 'processing')
         ORDER BY created_at ASC",
    )?;
    let rows = stmt
        .query_map(params![job_id], WorkUnitRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Claims a pending unit. Returns false if it was not pending.
pub fn claim(conn: &Connection, id: &str, now: DateTime<Utc>) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE work_units SET status = 'processing', started_at = ?2
         WHERE id = ?1 AND status = 'pending'",
        params![id, now],
    )?;
    Ok(changed == 1)
}

/// Finishes a processing unit. Returns false if it was not processing.
pub fn finish(
    conn: &Connection,
    id: &str,
    status: WorkUnitStatus,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE work_units SET status = ?2, error = ?3, finished_at = ?4
         WHERE id = ?1 AND status = 'processing'",
        params![id, status, error, now],
    )?;
    Ok(changed == 1)
}

/// Links an approved frame to a unit flagged `requires_approval`.
pub fn link_approval(
    conn: &Connection,
    id: &str,
    frame_id: &str,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE work_units SET approval_frame_id = ?2 WHERE id = ?1",
        params![id, frame_id],
    )?;
    Ok(changed == 1)
}
