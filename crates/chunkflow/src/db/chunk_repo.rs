//! Chunk repository: the time-bounded slices of a job.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{json_column, to_json_text, DatabaseError};
use crate::model::{ChunkStatus, TranscriptSegment};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkRow {
    pub id: String,
    pub job_id: String,
    /// 0-based position within the job.
    pub chunk_index: u32,
    /// Chunk count of the plan this chunk was created by.
    pub total_chunks: u32,
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub status: ChunkStatus,
    /// Chunk-relative transcript segments.
    pub transcript: Vec<TranscriptSegment>,
    /// Extracted frame references, in sampling order.
    pub frame_refs: Vec<String>,
    /// Highest ladder level of any step run on the chunk.
    pub quality_level: u8,
    /// Ladder level of the run that produced `frame_refs`; sets their
    /// sampling rate.
    pub frame_level: u8,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChunkRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            job_id: row.get("job_id")?,
            chunk_index: row.get("chunk_index")?,
            total_chunks: row.get("total_chunks")?,
            start_seconds: row.get("start_seconds")?,
            end_seconds: row.get("end_seconds")?,
            status: row.get("status")?,
            transcript: json_column(row, "transcript")?,
            frame_refs: json_column(row, "frame_refs")?,
            quality_level: row.get("quality_level")?,
            frame_level: row.get("frame_level")?,
            error: row.get("error")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }

    pub fn duration_seconds(&self) -> f64 {
        self.end_seconds - self.start_seconds
    }

    pub fn has_derivatives(&self) -> bool {
        !self.frame_refs.is_empty() && !self.transcript.is_empty()
    }
}

/// Aggregate chunk completion for one job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ChunkCounts {
    pub total: u32,
    pub completed: u32,
    pub failed: u32,
    pub merged: u32,
}

impl ChunkCounts {
    pub fn all_completed(&self) -> bool {
        self.total > 0 && self.completed == self.total
    }
}

/// Inserts one chunk. A duplicate `(job_id, chunk_index)` surfaces as a
/// unique-violation error.
pub fn insert(conn: &Connection, chunk: &ChunkRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO chunks (id, job_id, chunk_index, total_chunks, start_seconds, end_seconds,
         status, transcript, frame_refs, quality_level, frame_level, error, created_at,
         updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            chunk.id,
            chunk.job_id,
            chunk.chunk_index,
            chunk.total_chunks,
            chunk.start_seconds,
            chunk.end_seconds,
            chunk.status,
            to_json_text(&chunk.transcript)?,
            to_json_text(&chunk.frame_refs)?,
            chunk.quality_level,
            chunk.frame_level,
            chunk.error,
            chunk.created_at,
            chunk.updated_at,
        ],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<ChunkRow>, DatabaseError> {
    let row = conn
        .query_row("SELECT * FROM chunks WHERE id = ?1", params![id], ChunkRow::from_row)
        .optional()?;
    Ok(row)
}

/// All chunks of a job ordered by index.
pub fn list_by_job(conn: &Connection, job_id: &str) -> Result<Vec<ChunkRow>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT * FROM chunks WHERE job_id = ?1 ORDER BY chunk_index ASC")?;
    let rows = stmt
        .query_map(params![job_id], ChunkRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_by_job_and_status(
    conn: &Connection,
    job_id: &str,
    status: ChunkStatus,
) -> Result<Vec<ChunkRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM chunks WHERE job_id = ?1 AND status = ?2 ORDER BY chunk_index ASC",
    )?;
    let rows = stmt
        .query_map(params![job_id, status], ChunkRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn completion_counts(conn: &Connection, job_id: &str) -> Result<ChunkCounts, DatabaseError> {
    let counts = conn.query_row(
        "SELECT COUNT(*),
                COALESCE(SUM(status = 'completed'), 0),
                COALESCE(SUM(status = 'failed'), 0),
                COALESCE(SUM(status = 'merged'), 0)
         FROM chunks WHERE job_id = ?1",
        params![job_id],
        |r| {
            Ok(ChunkCounts {
                total: r.get(0)?,
                completed: r.get(1)?,
                failed: r.get(2)?,
                merged: r.get(3)?,
            })
        },
    )?;
    Ok(counts)
}

/// Moves a chunk to `to` only if it is currently in one of `from`.
/// Returns false when the chunk was not in an expected state.
pub fn transition_status(
    conn: &Connection,
    id: &str,
    from: &[ChunkStatus],
    to: ChunkStatus,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let allowed = from.iter().map(|s| s.as_str()).collect::<Vec<_>>();
    let current: Option<ChunkStatus> = conn
        .query_row("SELECT status FROM chunks WHERE id = ?1", params![id], |r| {
            r.get(0)
        })
        .optional()?;
    match current {
        Some(status) if allowed.contains(&status.as_str()) => {
            let changed = conn.execute(
                "UPDATE chunks SET status = ?2, error = COALESCE(?3, error), updated_at = ?4
                 WHERE id = ?1 AND status = ?5",
                params![id, to, error, now, status],
            )?;
            Ok(changed == 1)
        }
        _ => Ok(false),
    }
}

/// Appends step output to a chunk's derivative sets. The frame level is only
/// recorded when the output carries frames.
pub fn append_outputs(
    conn: &Connection,
    id: &str,
    transcript: &[TranscriptSegment],
    frame_refs: &[String],
    quality_level: u8,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let Some(mut chunk) = find_by_id(conn, id)? else {
        return Ok(());
    };
    chunk.transcript.extend_from_slice(transcript);
    chunk.frame_refs.extend_from_slice(frame_refs);
    let frame_level = (!frame_refs.is_empty()).then_some(quality_level);
    conn.execute(
        "UPDATE chunks SET transcript = ?2, frame_refs = ?3,
         quality_level = MAX(quality_level, ?4), frame_level = COALESCE(?5, frame_level),
         updated_at = ?6 WHERE id = ?1",
        params![
            id,
            to_json_text(&chunk.transcript)?,
            to_json_text(&chunk.frame_refs)?,
            quality_level,
            frame_level,
            now
        ],
    )?;
    Ok(())
}

/// Marks every completed chunk of a job as merged; returns the row count.
pub fn mark_merged(
    conn: &Connection,
    job_id: &str,
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let changed = conn.execute(
        "UPDATE chunks SET status = 'merged', updated_at = ?2
         WHERE job_id = ?1 AND status = 'completed'",
        params![job_id, now],
    )?;
    Ok(changed)
}
