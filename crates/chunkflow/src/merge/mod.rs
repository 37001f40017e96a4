//! Merge / finalizer: reassembles completed chunk outputs into one artifact.
//!
//! The merge itself is a governed `merge_chunks` frame on the job. The
//! completeness check and the writes run in one IMMEDIATE transaction, so of
//! two concurrent mergers exactly one completes the job and the other gets a
//! conflict.

pub mod manifest;

pub use manifest::{build_manifest, MergeManifest};

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::db::chunk_repo::{self, ChunkCounts};
use crate::db::job_repo::{self, MergeUpdate};
use crate::db::violation_repo::ViolationRow;
use crate::db::Database;
use crate::error::{ChunkflowError, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::governance::governor::authorize_job_operation;
use crate::governance::{FrameGovernor, FrameRequest};
use crate::model::{ApprovalStatus, ChunkStatus, EntityRef, FrameType, JobStatus};
use crate::storage::ArtifactStore;

pub const MERGE_OPERATION: &str = "merge_chunks";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOptions {
    /// Merge the completed chunks even though some failed.
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MergeSummary {
    pub job_id: String,
    pub frame_id: String,
    pub artifact_ref: String,
    pub merged_chunks: u32,
    pub skipped_chunks: Vec<u32>,
    pub duration_seconds: f64,
    pub quality_level: u8,
    pub degraded: bool,
    pub partial: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeOutcome {
    Merged(MergeSummary),
    /// The job was merged earlier; nothing changed.
    AlreadyMerged { artifact_ref: String },
    /// Chunks are still running. Not an error.
    NotYetComplete { completed: u32, total: u32 },
    /// The merge frame was rejected by critical violations.
    Blocked {
        frame_id: String,
        violations: Vec<ViolationRow>,
    },
    /// The merge frame waits for a human decision.
    AwaitingApproval { frame_id: String },
}

#[derive(Clone)]
pub struct Merger {
    db: Database,
    store: Arc<dyn ArtifactStore>,
    governor: FrameGovernor,
    events: EventBus,
    frame_sample_rate_hz: f64,
}

impl Merger {
    pub fn new(
        db: Database,
        store: Arc<dyn ArtifactStore>,
        governor: FrameGovernor,
        events: EventBus,
        frame_sample_rate_hz: f64,
    ) -> Self {
        Self {
            db,
            store,
            governor,
            events,
            frame_sample_rate_hz,
        }
    }

    pub fn merge(&self, job_id: &str, options: MergeOptions) -> Result<MergeOutcome> {
        self.merge_at(job_id, options, Utc::now())
    }

    pub fn merge_at(
        &self,
        job_id: &str,
        options: MergeOptions,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome> {
        let span = tracing::info_span!("merge", job_id = %job_id, force = options.force);
        let _guard = span.enter();

        let job = self
            .db
            .with_conn(|c| job_repo::find_by_id(c, job_id))?
            .ok_or_else(|| ChunkflowError::not_found(format!("job {job_id}")))?;

        if job.status == JobStatus::Completed {
            if let Some(artifact_ref) = job.artifact_ref {
                log::info!("Job {} already merged into {}", job_id, artifact_ref);
                return Ok(MergeOutcome::AlreadyMerged { artifact_ref });
            }
        }
        if !job.chunked {
            return Err(ChunkflowError::Validation(format!(
                "job {job_id} is not chunked; there is nothing to merge"
            )));
        }

        let counts = self.db.with_conn(|c| chunk_repo::completion_counts(c, job_id))?;
        if let Some(outcome) = precheck(job_id, &counts, options)? {
            return Ok(outcome);
        }

        let request = FrameRequest::new(
            FrameType::AiExecution,
            MERGE_OPERATION,
            EntityRef::job(job_id),
            json!({
                "status": JobStatus::Completed,
                "force": options.force,
                "completed_chunks": counts.completed,
                "total_chunks": counts.total,
            }),
            "merger",
        );
        let frame = self.governor.create_frame_at(request, now)?;
        match frame.status {
            ApprovalStatus::Approved => self.finalize(job_id, &frame.frame_id, options, now),
            ApprovalStatus::Pending => {
                log::info!("Merge of job {} waits on frame {}", job_id, frame.frame_id);
                Ok(MergeOutcome::AwaitingApproval {
                    frame_id: frame.frame_id,
                })
            }
            _ => {
                log::warn!("Merge of job {} blocked by frame {}", job_id, frame.frame_id);
                Ok(MergeOutcome::Blocked {
                    frame_id: frame.frame_id,
                    violations: frame.violations,
                })
            }
        }
    }

    /// Runs a merge whose frame a human has approved. The options are the
    /// ones proposed with the frame.
    pub(crate) fn complete_approved(
        &self,
        job_id: &str,
        frame_id: &str,
        options: MergeOptions,
    ) -> Result<MergeOutcome> {
        self.finalize(job_id, frame_id, options, Utc::now())
    }

    fn finalize(
        &self,
        job_id: &str,
        frame_id: &str,
        options: MergeOptions,
        now: DateTime<Utc>,
    ) -> Result<MergeOutcome> {
        let (summary, event) = self.db.with_tx(|conn| -> Result<(MergeSummary, PipelineEvent)> {
            authorize_job_operation(conn, frame_id, MERGE_OPERATION, job_id)?;
            let job = job_repo::find_by_id(conn, job_id)?
                .ok_or_else(|| ChunkflowError::not_found(format!("job {job_id}")))?;
            if job.status == JobStatus::Completed {
                return Err(ChunkflowError::Conflict(format!(
                    "job {job_id} was merged by a concurrent merge"
                )));
            }

            let counts = chunk_repo::completion_counts(conn, job_id)?;
            if precheck(job_id, &counts, options)?.is_some() {
                return Err(ChunkflowError::Conflict(format!(
                    "chunks of job {job_id} changed state before the merge could run"
                )));
            }

            let chunks = chunk_repo::list_by_job_and_status(conn, job_id, ChunkStatus::Completed)?;
            let manifest =
                build_manifest(job_id, chunks, counts.total, self.frame_sample_rate_hz, now);
            let bytes = serde_json::to_vec_pretty(&manifest)?;
            let artifact_ref = self
                .store
                .put(&format!("jobs/{job_id}/manifest.json"), &bytes)?;

            let merged = chunk_repo::mark_merged(conn, job_id, now)? as u32;
            let update = MergeUpdate {
                merged_chunks: merged,
                duration_seconds: manifest.duration_seconds,
                transcript: manifest.transcript.clone(),
                frame_refs: manifest.frames.iter().map(|f| f.frame_ref.clone()).collect(),
                artifact_ref: artifact_ref.clone(),
                quality_level: manifest.quality_level,
            };
            if !job_repo::finalize_merge(conn, job_id, &update, now)? {
                return Err(ChunkflowError::Conflict(format!(
                    "job {job_id} was completed concurrently"
                )));
            }

            let summary = MergeSummary {
                job_id: job_id.to_string(),
                frame_id: frame_id.to_string(),
                artifact_ref: artifact_ref.clone(),
                merged_chunks: merged,
                skipped_chunks: manifest.skipped_chunks.clone(),
                duration_seconds: manifest.duration_seconds,
                quality_level: manifest.quality_level,
                degraded: manifest.degraded,
                partial: manifest.partial,
            };
            let event = PipelineEvent::JobMerged {
                job_id: job_id.to_string(),
                artifact_ref,
                merged_chunks: merged,
                quality_level: manifest.quality_level,
                degraded: manifest.degraded,
            };
            EventBus::record(conn, &event, now)?;
            Ok((summary, event))
        })?;

        log::info!(
            "Merged {} chunks of job {} into {} (quality level {}, partial={})",
            summary.merged_chunks,
            job_id,
            summary.artifact_ref,
            summary.quality_level,
            summary.partial
        );
        self.events.publish([event]);
        Ok(MergeOutcome::Merged(summary))
    }
}

/// Decides whether chunk state allows a merge. `Ok(None)` means proceed.
fn precheck(
    job_id: &str,
    counts: &ChunkCounts,
    options: MergeOptions,
) -> Result<Option<MergeOutcome>> {
    if counts.total == 0 {
        return Err(ChunkflowError::Validation(format!("job {job_id} has no chunks")));
    }
    if counts.all_completed() {
        return Ok(None);
    }
    if !options.force {
        if counts.failed > 0 {
            return Err(ChunkflowError::Conflict(format!(
                "{} of {} chunks failed for job {}; force merge is required to proceed",
                counts.failed, counts.total, job_id
            )));
        }
        return Ok(Some(MergeOutcome::NotYetComplete {
            completed: counts.completed,
            total: counts.total,
        }));
    }
    if counts.completed == 0 {
        return Err(ChunkflowError::Conflict(format!(
            "job {job_id} has no completed chunks to merge"
        )));
    }
    Ok(None)
}
