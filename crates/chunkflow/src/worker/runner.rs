//! Advances one work unit through its step.
//!
//! Every state change a unit causes goes through an execution frame: the
//! claim, the completion, and the proposal to fail an entity once retries
//! are spent. Retries climb the degradation ladder one level per attempt.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::json;

use super::executor::{StepExecutor, StepOutput, StepRequest};
use crate::constraints::rules::FALSE_FAILURE_GUARD;
use crate::db::chunk_repo;
use crate::db::job_repo;
use crate::db::violation_repo::ViolationRow;
use crate::db::work_unit_repo::{self, NewWorkUnit, WorkUnitRow};
use crate::db::Database;
use crate::degradation::{mode_for_retry, profile_for_level, DegradationProfile, MAX_LEVEL};
use crate::error::{ChunkflowError, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::governance::{FrameGovernor, FrameOutcome, FrameRequest};
use crate::merge::{MergeOptions, MergeOutcome, Merger};
use crate::model::{
    ApprovalStatus, ChunkStatus, EntityRef, EntityType, FrameType, JobStatus, PipelineStep,
    WorkUnitStatus,
};

pub const CLAIM_OPERATION: &str = "claim_work_unit";
pub const COMPLETE_OPERATION: &str = "complete_step";
pub const FAIL_OPERATION: &str = "mark_failed";

const INITIATOR: &str = "step-runner";

/// What a call to [`StepRunner::advance`] did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AdvanceOutcome {
    /// The step finished. `next` is the follow-up unit, if any.
    Completed {
        unit_id: String,
        next: Option<WorkUnitRow>,
        quality_level: u8,
    },
    /// The step failed and was queued again one level down the ladder.
    Retrying {
        unit_id: String,
        next: WorkUnitRow,
        level: u8,
    },
    /// Retries are spent and a `mark_failed` frame was proposed.
    FailureProposed {
        unit_id: String,
        frame_id: String,
        status: ApprovalStatus,
    },
    /// Failing the entity would have discarded finished outputs, so it was
    /// completed at the lowest quality level instead.
    Salvaged {
        unit_id: String,
        frame_id: String,
        next: Option<WorkUnitRow>,
    },
    Skipped {
        unit_id: String,
        reason: String,
    },
    Blocked {
        unit_id: String,
        frame_id: String,
        violations: Vec<ViolationRow>,
    },
    AwaitingApproval {
        unit_id: String,
        frame_id: String,
    },
    Merged {
        unit_id: String,
        outcome: MergeOutcome,
    },
}

impl AdvanceOutcome {
    /// The unit that should run next, if this advance queued one.
    pub fn follow_up(&self) -> Option<&WorkUnitRow> {
        match self {
            AdvanceOutcome::Completed { next, .. } | AdvanceOutcome::Salvaged { next, .. } => {
                next.as_ref()
            }
            AdvanceOutcome::Retrying { next, .. } => Some(next),
            _ => None,
        }
    }
}

/// The step after `current` under `profile`, or `None` when the entity is
/// done.
pub fn next_step(current: PipelineStep, profile: &DegradationProfile) -> Option<PipelineStep> {
    match current {
        PipelineStep::Probe => Some(PipelineStep::Transcription),
        PipelineStep::Transcription if profile.transcript_only => {
            (!profile.skip_rendering).then_some(PipelineStep::Rendering)
        }
        PipelineStep::Transcription => Some(PipelineStep::FrameExtraction),
        PipelineStep::FrameExtraction => {
            (!profile.skip_rendering).then_some(PipelineStep::Rendering)
        }
        PipelineStep::Rendering | PipelineStep::Merge => None,
    }
}

/// Whether `profile` drops `step` entirely.
fn skipped_by(step: PipelineStep, profile: &DegradationProfile) -> bool {
    match step {
        PipelineStep::Rendering => profile.skip_rendering,
        PipelineStep::FrameExtraction => profile.transcript_only,
        _ => false,
    }
}

fn target_of(unit: &WorkUnitRow) -> EntityRef {
    match &unit.chunk_id {
        Some(chunk_id) => EntityRef::chunk(chunk_id.clone()),
        None => EntityRef::job(unit.job_id.clone()),
    }
}

fn emit(
    conn: &Connection,
    events: &mut Vec<PipelineEvent>,
    event: PipelineEvent,
    now: DateTime<Utc>,
) -> Result<()> {
    EventBus::record(conn, &event, now)?;
    events.push(event);
    Ok(())
}

/// Enqueues on the caller's transaction and records `StepQueued` for a new
/// unit.
pub(crate) fn queue_in(
    conn: &Connection,
    unit: &NewWorkUnit,
    now: DateTime<Utc>,
    events: &mut Vec<PipelineEvent>,
) -> Result<(WorkUnitRow, bool)> {
    let (row, created) = work_unit_repo::enqueue(conn, unit, now)?;
    if created {
        emit(
            conn,
            events,
            PipelineEvent::StepQueued {
                unit_id: row.id.clone(),
                job_id: row.job_id.clone(),
                chunk_id: row.chunk_id.clone(),
                step: row.step,
                retry_count: row.retry_count,
            },
            now,
        )?;
    }
    Ok((row, created))
}

/// Marks the target failed. Used once a `mark_failed` frame is approved,
/// automatically or by a human.
pub(crate) fn apply_failure(
    conn: &Connection,
    target: &EntityRef,
    error: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    match target.entity_type {
        EntityType::Chunk => {
            let Some(chunk) = chunk_repo::find_by_id(conn, &target.id)? else {
                return Err(ChunkflowError::not_found(target));
            };
            if chunk_repo::transition_status(
                conn,
                &chunk.id,
                &[ChunkStatus::Pending, ChunkStatus::Processing],
                ChunkStatus::Failed,
                Some(error),
                now,
            )? {
                job_repo::increment_failed_chunks(conn, &chunk.job_id, now)?;
            }
        }
        EntityType::Job => {
            job_repo::set_status(conn, &target.id, JobStatus::Failed, Some(error), now)?;
        }
        EntityType::WorkUnit => {
            work_unit_repo::finish(conn, &target.id, WorkUnitStatus::Failed, Some(error), now)?;
        }
    }
    Ok(())
}

#[derive(Clone)]
pub struct StepRunner {
    db: Database,
    governor: FrameGovernor,
    merger: Merger,
    events: EventBus,
    executor: Arc<dyn StepExecutor>,
    max_retries: u32,
}

impl StepRunner {
    pub fn new(
        db: Database,
        governor: FrameGovernor,
        merger: Merger,
        events: EventBus,
        executor: Arc<dyn StepExecutor>,
        max_retries: u32,
    ) -> Self {
        Self {
            db,
            governor,
            merger,
            events,
            executor,
            max_retries,
        }
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Queues a unit, returning the existing live unit for the same step if
    /// there is one.
    pub fn queue(&self, unit: NewWorkUnit) -> Result<(WorkUnitRow, bool)> {
        let now = Utc::now();
        let mut events = Vec::new();
        let queued = self
            .db
            .with_tx(|conn| queue_in(conn, &unit, now, &mut events))?;
        self.events.publish(events);
        Ok(queued)
    }

    /// Queues the first step for every pending chunk of a planned job, or one
    /// job-level unit when the job is not chunked.
    pub fn start_job(&self, job_id: &str) -> Result<Vec<WorkUnitRow>> {
        let now = Utc::now();
        let mut events = Vec::new();
        let units = self.db.with_tx(|conn| -> Result<Vec<WorkUnitRow>> {
            let job = job_repo::find_by_id(conn, job_id)?
                .ok_or_else(|| ChunkflowError::not_found(format!("job {job_id}")))?;
            if job.status.is_terminal() {
                return Err(ChunkflowError::Conflict(format!(
                    "job {job_id} is already {}",
                    job.status
                )));
            }

            let mut units = Vec::new();
            if job.chunked {
                for chunk in chunk_repo::list_by_job_and_status(conn, job_id, ChunkStatus::Pending)? {
                    let unit = NewWorkUnit {
                        job_id: job_id.to_string(),
                        chunk_id: Some(chunk.id.clone()),
                        step: PipelineStep::Transcription,
                        retry_count: 0,
                        requires_approval: false,
                        unit_duration_seconds: Some(chunk.duration_seconds()),
                    };
                    units.push(queue_in(conn, &unit, now, &mut events)?.0);
                }
            } else {
                let unit = NewWorkUnit {
                    job_id: job_id.to_string(),
                    chunk_id: None,
                    step: PipelineStep::Transcription,
                    retry_count: 0,
                    requires_approval: false,
                    unit_duration_seconds: (job.duration_seconds > 0.0)
                        .then_some(job.duration_seconds),
                };
                units.push(queue_in(conn, &unit, now, &mut events)?.0);
            }
            Ok(units)
        })?;

        log::info!("Queued {} units for job {}", units.len(), job_id);
        self.events.publish(events);
        Ok(units)
    }

    /// Claims and runs a pending unit, then records what happened.
    pub fn advance(&self, unit_id: &str) -> Result<AdvanceOutcome> {
        let span = tracing::info_span!("advance", unit_id = %unit_id);
        let _guard = span.enter();

        let unit = self
            .db
            .with_conn(|c| work_unit_repo::find_by_id(c, unit_id))?
            .ok_or_else(|| ChunkflowError::not_found(format!("work unit {unit_id}")))?;
        if unit.status != WorkUnitStatus::Pending {
            return Ok(AdvanceOutcome::Skipped {
                unit_id: unit.id,
                reason: format!("unit is {}", unit.status),
            });
        }

        let claim = self.governor.create_frame(FrameRequest::new(
            FrameType::AiExecution,
            CLAIM_OPERATION,
            EntityRef::work_unit(unit.id.clone()),
            json!({"status": WorkUnitStatus::Processing, "step": unit.step}),
            INITIATOR,
        ))?;
        match claim.status {
            ApprovalStatus::Approved => {}
            ApprovalStatus::Pending => {
                return Ok(AdvanceOutcome::AwaitingApproval {
                    unit_id: unit.id,
                    frame_id: claim.frame_id,
                })
            }
            _ => {
                log::warn!("Claim of unit {} rejected by frame {}", unit.id, claim.frame_id);
                return Ok(AdvanceOutcome::Blocked {
                    unit_id: unit.id,
                    frame_id: claim.frame_id,
                    violations: claim.violations,
                });
            }
        }

        let now = Utc::now();
        let claimed = self.db.with_tx(|conn| -> Result<bool> {
            if !work_unit_repo::claim(conn, &unit.id, now)? {
                return Ok(false);
            }
            job_repo::touch_heartbeat(conn, &unit.job_id, unit.step.as_str(), now)?;
            if let Some(chunk_id) = &unit.chunk_id {
                chunk_repo::transition_status(
                    conn,
                    chunk_id,
                    &[ChunkStatus::Pending, ChunkStatus::Processing],
                    ChunkStatus::Processing,
                    None,
                    now,
                )?;
            }
            Ok(true)
        })?;
        if !claimed {
            return Ok(AdvanceOutcome::Skipped {
                unit_id: unit.id,
                reason: "claimed by another worker".to_string(),
            });
        }

        if unit.step == PipelineStep::Merge {
            return self.run_merge(&unit);
        }

        let profile = mode_for_retry(unit.retry_count);
        let output = if skipped_by(unit.step, profile) {
            log::debug!("Step {} skipped at level {}", unit.step, profile.level);
            StepOutput::ok()
        } else {
            let request = self.build_request(&unit, profile)?;
            log::info!(
                "Running {} for {} (attempt {}, {} mode)",
                unit.step,
                target_of(&unit),
                unit.retry_count + 1,
                profile.name
            );
            self.executor.run_step(&request)
        };

        if output.success {
            self.record_success(&unit, profile, output)
        } else {
            let error = output
                .error
                .unwrap_or_else(|| format!("{} step failed", unit.step));
            self.record_failure(&unit, &error)
        }
    }

    fn build_request(&self, unit: &WorkUnitRow, profile: &DegradationProfile) -> Result<StepRequest> {
        let (job, chunk) = self.db.with_conn(|conn| {
            let job = job_repo::find_by_id(conn, &unit.job_id)?;
            let chunk = match &unit.chunk_id {
                Some(chunk_id) => chunk_repo::find_by_id(conn, chunk_id)?,
                None => None,
            };
            Ok((job, chunk))
        })?;
        let job = job.ok_or_else(|| ChunkflowError::not_found(format!("job {}", unit.job_id)))?;
        let (start_seconds, end_seconds) = match (&unit.chunk_id, chunk) {
            (Some(_), Some(chunk)) => (chunk.start_seconds, chunk.end_seconds),
            (Some(chunk_id), None) => {
                return Err(ChunkflowError::not_found(format!("chunk {chunk_id}")))
            }
            (None, _) => (0.0, job.duration_seconds),
        };
        Ok(StepRequest {
            unit_id: unit.id.clone(),
            job_id: unit.job_id.clone(),
            chunk_id: unit.chunk_id.clone(),
            step: unit.step,
            source_ref: job.source_ref,
            start_seconds,
            end_seconds,
            profile: *profile,
        })
    }

    fn record_success(
        &self,
        unit: &WorkUnitRow,
        profile: &DegradationProfile,
        output: StepOutput,
    ) -> Result<AdvanceOutcome> {
        let now = Utc::now();
        let (outcome, events) = self.db.with_tx(|conn| -> Result<(AdvanceOutcome, Vec<PipelineEvent>)> {
            let request = FrameRequest::new(
                FrameType::AiExecution,
                COMPLETE_OPERATION,
                target_of(unit),
                json!({
                    "step": unit.step,
                    "frame_refs": output.frame_refs.len(),
                    "transcript_segments": output.transcript.len(),
                    "quality_level": profile.level,
                }),
                INITIATOR,
            );
            let (frame, mut events) = self.governor.create_frame_in(conn, &request, now)?;
            if !frame.is_approved() {
                work_unit_repo::finish(
                    conn,
                    &unit.id,
                    WorkUnitStatus::Failed,
                    Some(&format!("completion frame {} is {}", frame.frame_id, frame.status)),
                    now,
                )?;
                return Ok((unresolved(unit, frame), events));
            }

            work_unit_repo::finish(conn, &unit.id, WorkUnitStatus::Completed, None, now)?;
            self.attach_outputs(conn, unit, &output, profile.level, now)?;
            job_repo::touch_heartbeat(conn, &unit.job_id, unit.step.as_str(), now)?;
            emit(
                conn,
                &mut events,
                PipelineEvent::StepCompleted {
                    unit_id: unit.id.clone(),
                    job_id: unit.job_id.clone(),
                    chunk_id: unit.chunk_id.clone(),
                    step: unit.step,
                    quality_level: profile.level,
                },
                now,
            )?;

            // A job-level step on a completed job is a recovery re-run of
            // that one step; nothing follows it.
            let recovering = unit.chunk_id.is_none()
                && job_repo::find_by_id(conn, &unit.job_id)?
                    .is_some_and(|job| job.status == JobStatus::Completed);
            let follow_step = if recovering {
                None
            } else {
                next_step(unit.step, profile)
            };
            let next = match follow_step {
                Some(step) => {
                    let follow = NewWorkUnit {
                        job_id: unit.job_id.clone(),
                        chunk_id: unit.chunk_id.clone(),
                        step,
                        retry_count: unit.retry_count,
                        requires_approval: false,
                        unit_duration_seconds: unit.unit_duration_seconds,
                    };
                    Some(queue_in(conn, &follow, now, &mut events)?.0)
                }
                None if recovering => None,
                None => self.finish_entity(conn, unit, now, &mut events)?,
            };
            Ok((
                AdvanceOutcome::Completed {
                    unit_id: unit.id.clone(),
                    next,
                    quality_level: profile.level,
                },
                events,
            ))
        })?;
        self.events.publish(events);
        Ok(outcome)
    }

    fn attach_outputs(
        &self,
        conn: &Connection,
        unit: &WorkUnitRow,
        output: &StepOutput,
        level: u8,
        now: DateTime<Utc>,
    ) -> Result<()> {
        match &unit.chunk_id {
            Some(chunk_id) => {
                chunk_repo::append_outputs(conn, chunk_id, &output.transcript, &output.frame_refs, level, now)?;
            }
            None => {
                let job = job_repo::find_by_id(conn, &unit.job_id)?
                    .ok_or_else(|| ChunkflowError::not_found(format!("job {}", unit.job_id)))?;
                let mut transcript = job.transcript;
                transcript.extend_from_slice(&output.transcript);
                let mut frame_refs = job.frame_refs;
                frame_refs.extend_from_slice(&output.frame_refs);
                job_repo::record_outputs(conn, &unit.job_id, &transcript, &frame_refs, level, now)?;
            }
        }
        Ok(())
    }

    /// Closes out an entity whose last step finished. When the last chunk of
    /// a job completes, the job-level merge unit is queued and returned.
    fn finish_entity(
        &self,
        conn: &Connection,
        unit: &WorkUnitRow,
        now: DateTime<Utc>,
        events: &mut Vec<PipelineEvent>,
    ) -> Result<Option<WorkUnitRow>> {
        let Some(chunk_id) = &unit.chunk_id else {
            job_repo::set_status(conn, &unit.job_id, JobStatus::Completed, None, now)?;
            log::info!("Job {} completed without chunking", unit.job_id);
            return Ok(None);
        };

        if !chunk_repo::transition_status(
            conn,
            chunk_id,
            &[ChunkStatus::Pending, ChunkStatus::Processing],
            ChunkStatus::Completed,
            None,
            now,
        )? {
            return Ok(None);
        }
        job_repo::increment_completed_chunks(conn, &unit.job_id, now)?;

        let counts = chunk_repo::completion_counts(conn, &unit.job_id)?;
        if !counts.all_completed() {
            log::debug!(
                "Chunk {} completed ({}/{})",
                chunk_id,
                counts.completed,
                counts.total
            );
            return Ok(None);
        }

        let merge = NewWorkUnit {
            job_id: unit.job_id.clone(),
            chunk_id: None,
            step: PipelineStep::Merge,
            retry_count: 0,
            requires_approval: false,
            unit_duration_seconds: None,
        };
        let (row, _) = queue_in(conn, &merge, now, events)?;
        log::info!("All {} chunks of job {} completed; merge queued", counts.total, unit.job_id);
        Ok(Some(row))
    }

    fn record_failure(&self, unit: &WorkUnitRow, error: &str) -> Result<AdvanceOutcome> {
        let now = Utc::now();
        let will_retry = unit.retry_count < self.max_retries;
        let (outcome, events) = self.db.with_tx(|conn| -> Result<(AdvanceOutcome, Vec<PipelineEvent>)> {
            let mut events = Vec::new();
            work_unit_repo::finish(conn, &unit.id, WorkUnitStatus::Failed, Some(error), now)?;
            emit(
                conn,
                &mut events,
                PipelineEvent::StepFailed {
                    unit_id: unit.id.clone(),
                    job_id: unit.job_id.clone(),
                    chunk_id: unit.chunk_id.clone(),
                    step: unit.step,
                    retry_count: unit.retry_count,
                    error: error.to_string(),
                    will_retry,
                },
                now,
            )?;

            if will_retry {
                let retry = NewWorkUnit {
                    job_id: unit.job_id.clone(),
                    chunk_id: unit.chunk_id.clone(),
                    step: unit.step,
                    retry_count: unit.retry_count + 1,
                    requires_approval: false,
                    unit_duration_seconds: unit.unit_duration_seconds,
                };
                let (next, _) = queue_in(conn, &retry, now, &mut events)?;
                let level = mode_for_retry(next.retry_count).level;
                log::warn!(
                    "{} failed for {}: {} (retrying at level {})",
                    unit.step,
                    target_of(unit),
                    error,
                    level
                );
                return Ok((
                    AdvanceOutcome::Retrying {
                        unit_id: unit.id.clone(),
                        next,
                        level,
                    },
                    events,
                ));
            }

            let target = target_of(unit);
            let request = FrameRequest::new(
                FrameType::AiExecution,
                FAIL_OPERATION,
                target.clone(),
                json!({"status": "failed", "error": error, "step": unit.step}),
                INITIATOR,
            )
            .with_metadata(json!({"unit_id": unit.id, "retry_count": unit.retry_count}));
            let (frame, frame_events) = self.governor.create_frame_in(conn, &request, now)?;
            events.extend(frame_events);

            let guarded = frame
                .violations
                .iter()
                .any(|v| v.constraint_name == FALSE_FAILURE_GUARD);
            let status = frame.status;
            let outcome = match status {
                ApprovalStatus::Approved => {
                    apply_failure(conn, &target, error, now)?;
                    log::error!("{} marked failed after {} attempts", target, unit.retry_count + 1);
                    AdvanceOutcome::FailureProposed {
                        unit_id: unit.id.clone(),
                        frame_id: frame.frame_id,
                        status,
                    }
                }
                ApprovalStatus::Rejected if guarded => {
                    let next = self.salvage(conn, unit, now, &mut events)?;
                    AdvanceOutcome::Salvaged {
                        unit_id: unit.id.clone(),
                        frame_id: frame.frame_id,
                        next,
                    }
                }
                status => AdvanceOutcome::FailureProposed {
                    unit_id: unit.id.clone(),
                    frame_id: frame.frame_id,
                    status,
                },
            };
            Ok((outcome, events))
        })?;
        self.events.publish(events);
        Ok(outcome)
    }

    /// Completes an entity that holds outputs at the lowest quality level.
    fn salvage(
        &self,
        conn: &Connection,
        unit: &WorkUnitRow,
        now: DateTime<Utc>,
        events: &mut Vec<PipelineEvent>,
    ) -> Result<Option<WorkUnitRow>> {
        let safe = profile_for_level(MAX_LEVEL);
        self.attach_outputs(conn, unit, &StepOutput::ok(), safe.level, now)?;
        log::warn!(
            "{} kept at level {} ({}) instead of being failed",
            target_of(unit),
            safe.level,
            safe.name
        );
        self.finish_entity(conn, unit, now, events)
    }

    fn run_merge(&self, unit: &WorkUnitRow) -> Result<AdvanceOutcome> {
        let result = self.merger.merge(&unit.job_id, MergeOptions::default());
        let now = Utc::now();
        let error = match &result {
            Ok(MergeOutcome::NotYetComplete { completed, total }) => {
                Some(format!("{completed} of {total} chunks completed"))
            }
            Ok(MergeOutcome::Blocked { frame_id, .. }) => {
                Some(format!("merge blocked by frame {frame_id}"))
            }
            Ok(_) => None,
            Err(e) => Some(e.to_string()),
        };

        let events = self.db.with_tx(|conn| -> Result<Vec<PipelineEvent>> {
            let mut events = Vec::new();
            let status = if error.is_some() {
                WorkUnitStatus::Failed
            } else {
                WorkUnitStatus::Completed
            };
            work_unit_repo::finish(conn, &unit.id, status, error.as_deref(), now)?;
            let event = match &error {
                None => PipelineEvent::StepCompleted {
                    unit_id: unit.id.clone(),
                    job_id: unit.job_id.clone(),
                    chunk_id: None,
                    step: PipelineStep::Merge,
                    quality_level: 0,
                },
                Some(error) => PipelineEvent::StepFailed {
                    unit_id: unit.id.clone(),
                    job_id: unit.job_id.clone(),
                    chunk_id: None,
                    step: PipelineStep::Merge,
                    retry_count: unit.retry_count,
                    error: error.clone(),
                    will_retry: false,
                },
            };
            emit(conn, &mut events, event, now)?;
            Ok(events)
        })?;
        self.events.publish(events);

        result.map(|outcome| AdvanceOutcome::Merged {
            unit_id: unit.id.clone(),
            outcome,
        })
    }
}

fn unresolved(unit: &WorkUnitRow, frame: FrameOutcome) -> AdvanceOutcome {
    if frame.is_rejected() {
        AdvanceOutcome::Blocked {
            unit_id: unit.id.clone(),
            frame_id: frame.frame_id,
            violations: frame.violations,
        }
    } else {
        AdvanceOutcome::AwaitingApproval {
            unit_id: unit.id.clone(),
            frame_id: frame.frame_id,
        }
    }
}
