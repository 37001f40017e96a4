//! Job repository: CRUD operations for the `jobs` table.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{json_column, to_json_text, DatabaseError};
use crate::model::{ConstraintStatus, JobStatus, TranscriptSegment};

/// A job row from the database.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobRow {
    pub id: String,
    /// Where the source media lives; recovery is impossible without it.
    pub source_ref: Option<String>,
    pub payload_bytes: Option<i64>,
    /// Seconds; 0 until probed or estimated.
    pub duration_seconds: f64,
    pub duration_estimated: bool,
    pub status: JobStatus,
    pub current_step: Option<String>,
    pub chunked: bool,
    pub chunk_count: u32,
    pub completed_chunks: u32,
    pub failed_chunks: u32,
    pub cost_estimate: Option<f64>,
    pub constraint_status: ConstraintStatus,
    pub governance_locked: bool,
    pub transcript: Vec<TranscriptSegment>,
    pub frame_refs: Vec<String>,
    pub artifact_ref: Option<String>,
    /// Highest degradation level that contributed to the output.
    pub quality_level: u8,
    pub error: Option<String>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRow {
    /// A freshly ingested job.
    pub fn new(
        id: impl Into<String>,
        source_ref: Option<String>,
        payload_bytes: Option<i64>,
        duration_seconds: f64,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            source_ref,
            payload_bytes,
            duration_seconds,
            duration_estimated: false,
            status: JobStatus::Queued,
            current_step: None,
            chunked: false,
            chunk_count: 0,
            completed_chunks: 0,
            failed_chunks: 0,
            cost_estimate: None,
            constraint_status: ConstraintStatus::Valid,
            governance_locked: false,
            transcript: Vec::new(),
            frame_refs: Vec::new(),
            artifact_ref: None,
            quality_level: 0,
            error: None,
            last_heartbeat: None,
            created_at: now,
            updated_at: now,
            completed_at: None,
        }
    }

    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            source_ref: row.get("source_ref")?,
            payload_bytes: row.get("payload_bytes")?,
            duration_seconds: row.get("duration_seconds")?,
            duration_estimated: row.get("duration_estimated")?,
            status: row.get("status")?,
            current_step: row.get("current_step")?,
            chunked: row.get("chunked")?,
            chunk_count: row.get("chunk_count")?,
            completed_chunks: row.get("completed_chunks")?,
            failed_chunks: row.get("failed_chunks")?,
            cost_estimate: row.get("cost_estimate")?,
            constraint_status: row.get("constraint_status")?,
            governance_locked: row.get("governance_locked")?,
            transcript: json_column(row, "transcript")?,
            frame_refs: json_column(row, "frame_refs")?,
            artifact_ref: row.get("artifact_ref")?,
            quality_level: row.get("quality_level")?,
            error: row.get("error")?,
            last_heartbeat: row.get("last_heartbeat")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
            completed_at: row.get("completed_at")?,
        })
    }

    /// True when both derivative sets are populated.
    pub fn has_derivatives(&self) -> bool {
        !self.frame_refs.is_empty() && !self.transcript.is_empty()
    }
}

/// Planning outcome written back onto a job.
#[derive(Debug, Clone, PartialEq)]
pub struct PlanUpdate {
    pub chunked: bool,
    pub chunk_count: u32,
    pub duration_seconds: f64,
    pub duration_estimated: bool,
    pub cost_estimate: f64,
}

/// Final aggregate written by the merge step.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeUpdate {
    pub merged_chunks: u32,
    pub duration_seconds: f64,
    pub transcript: Vec<TranscriptSegment>,
    pub frame_refs: Vec<String>,
    pub artifact_ref: String,
    pub quality_level: u8,
}

/// Inserts a new job row.
pub fn insert(conn: &Connection, job: &JobRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO jobs (id, source_ref, payload_bytes, duration_seconds, duration_estimated,
         status, current_step, chunked, chunk_count, completed_chunks, failed_chunks,
         cost_estimate, constraint_status, governance_locked, transcript, frame_refs,
         artifact_ref, quality_level, error, last_heartbeat, created_at, updated_at, completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
         ?18, ?19, ?20, ?21, ?22, ?23)",
        params![
            job.id,
            job.source_ref,
            job.payload_bytes,
            job.duration_seconds,
            job.duration_estimated,
            job.status,
            job.current_step,
            job.chunked,
            job.chunk_count,
            job.completed_chunks,
            job.failed_chunks,
            job.cost_estimate,
            job.constraint_status,
            job.governance_locked,
            to_json_text(&job.transcript)?,
            to_json_text(&job.frame_refs)?,
            job.artifact_ref,
            job.quality_level,
            job.error,
            job.last_heartbeat,
            job.created_at,
            job.updated_at,
            job.completed_at,
        ],
    )?;
    Ok(())
}

/// Finds a job by its ID.
pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<JobRow>, DatabaseError> {
    let row = conn
        .query_row("SELECT * FROM jobs WHERE id = ?1", params![id], JobRow::from_row)
        .optional()?;
    Ok(row)
}

/// Lists jobs with the given status, oldest first.
pub fn list_by_status(conn: &Connection, status: JobStatus) -> Result<Vec<JobRow>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT * FROM jobs WHERE status = ?1 ORDER BY created_at ASC")?;
    let rows = stmt
        .query_map(params![status], JobRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Writes the planning decision onto the job.
pub fn record_plan(
    conn: &Connection,
    id: &str,
    plan: &PlanUpdate,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE jobs SET chunked = ?2, chunk_count = ?3, completed_chunks = 0, failed_chunks = 0,
         duration_seconds = ?4, duration_estimated = ?5, cost_estimate = ?6, updated_at = ?7
         WHERE id = ?1",
        params![
            id,
            plan.chunked,
            plan.chunk_count,
            plan.duration_seconds,
            plan.duration_estimated,
            plan.cost_estimate,
            now
        ],
    )?;
    Ok(())
}

pub fn set_constraint_status(
    conn: &Connection,
    id: &str,
    status: ConstraintStatus,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE jobs SET constraint_status = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, status, now],
    )?;
    Ok(())
}

/// Returns false when the job does not exist.
pub fn set_governance_lock(
    conn: &Connection,
    id: &str,
    locked: bool,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET governance_locked = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, locked, now],
    )?;
    Ok(changed == 1)
}

/// Records worker liveness and the step in progress. A queued job becomes
/// processing on its first heartbeat.
pub fn touch_heartbeat(
    conn: &Connection,
    id: &str,
    step: &str,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE jobs SET last_heartbeat = ?3, current_step = ?2, updated_at = ?3,
         status = CASE WHEN status = 'queued' THEN 'processing' ELSE status END
         WHERE id = ?1",
        params![id, step, now],
    )?;
    Ok(())
}

pub fn set_status(
    conn: &Connection,
    id: &str,
    status: JobStatus,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let completed_at = status.is_terminal().then_some(now);
    conn.execute(
        "UPDATE jobs SET status = ?2, error = COALESCE(?3, error), completed_at = ?4,
         updated_at = ?5 WHERE id = ?1",
        params![id, status, error, completed_at, now],
    )?;
    Ok(())
}

/// Puts a failed or stuck job back into processing for recovery, with the
/// failed-chunk counter reset to what the chunk table still shows.
pub fn reopen(
    conn: &Connection,
    id: &str,
    failed_chunks: u32,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE jobs SET status = 'processing', error = NULL, completed_at = NULL,
         failed_chunks = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, failed_chunks, now],
    )?;
    Ok(())
}

pub fn increment_completed_chunks(
    conn: &Connection,
    id: &str,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE jobs SET completed_chunks = completed_chunks + 1, updated_at = ?2 WHERE id = ?1",
        params![id, now],
    )?;
    Ok(())
}

pub fn increment_failed_chunks(
    conn: &Connection,
    id: &str,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE jobs SET failed_chunks = failed_chunks + 1, updated_at = ?2 WHERE id = ?1",
        params![id, now],
    )?;
    Ok(())
}

/// Replaces the job-level derivative sets (unchunked jobs and recovery).
pub fn record_outputs(
    conn: &Connection,
    id: &str,
    transcript: &[TranscriptSegment],
    frame_refs: &[String],
    quality_level: u8,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE jobs SET transcript = ?2, frame_refs = ?3,
         quality_level = MAX(quality_level, ?4), updated_at = ?5 WHERE id = ?1",
        params![
            id,
            to_json_text(&transcript)?,
            to_json_text(&frame_refs)?,
            quality_level,
            now
        ],
    )?;
    Ok(())
}

/// Marks the job completed with the merged aggregate. Guarded on the job not
/// already being completed; returns false when another merger got there first.
pub fn finalize_merge(
    conn: &Connection,
    id: &str,
    merge: &MergeUpdate,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE jobs SET status = 'completed', completed_chunks = ?2, duration_seconds = ?3,
         transcript = ?4, frame_refs = ?5, artifact_ref = ?6, quality_level = ?7,
         current_step = 'merge', completed_at = ?8, updated_at = ?8
         WHERE id = ?1 AND status != 'completed'",
        params![
            id,
            merge.merged_chunks,
            merge.duration_seconds,
            to_json_text(&merge.transcript)?,
            to_json_text(&merge.frame_refs)?,
            merge.artifact_ref,
            merge.quality_level,
            now
        ],
    )?;
    Ok(changed == 1)
}
