//! Governed recovery: re-queues exactly the work a job is missing.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

use super::{verify_job, HealthMonitor};
use crate::db::chunk_repo;
use crate::db::job_repo::{self, JobRow};
use crate::db::violation_repo::ViolationRow;
use crate::db::work_unit_repo::{self, NewWorkUnit, WorkUnitRow};
use crate::db::DatabaseError;
use crate::error::{ChunkflowError, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::governance::governor::authorize_job_operation;
use crate::governance::FrameRequest;
use crate::model::{
    ApprovalStatus, ChunkStatus, EntityRef, FrameType, JobStatus, PipelineStep, TranscriptSegment,
    WorkUnitStatus,
};
use crate::worker::runner::queue_in;

pub const RECOVER_OPERATION: &str = "recover_outputs";

const INITIATOR: &str = "health-monitor";

/// A chunk that is not finished and has nothing queued.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResumePoint {
    pub chunk_id: String,
    pub step: PipelineStep,
}

/// What recovery would do for a job, computed from persisted state.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RecoveryPlan {
    /// Job-level steps whose outputs are missing.
    pub missing_steps: Vec<PipelineStep>,
    pub stalled_units: Vec<String>,
    pub failed_chunks: Vec<String>,
    pub resume: Vec<ResumePoint>,
    pub reopen_job: bool,
}

impl RecoveryPlan {
    pub fn is_empty(&self) -> bool {
        self.missing_steps.is_empty()
            && self.stalled_units.is_empty()
            && self.failed_chunks.is_empty()
            && self.resume.is_empty()
            && !self.reopen_job
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryOutcome {
    NothingToRecover,
    /// Work was queued. The data exists only once those units complete.
    Requeued,
    /// No source reference, or nothing could be queued.
    Unrecoverable,
    /// The recovery frame was rejected.
    Blocked,
    AwaitingApproval,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecoveryReport {
    pub job_id: String,
    pub outcome: RecoveryOutcome,
    pub frame_id: Option<String>,
    pub plan: RecoveryPlan,
    pub actions: Vec<String>,
    pub requeued: Vec<WorkUnitRow>,
    pub violations: Vec<ViolationRow>,
}

impl RecoveryReport {
    fn new(job_id: &str, outcome: RecoveryOutcome, plan: RecoveryPlan) -> Self {
        Self {
            job_id: job_id.to_string(),
            outcome,
            frame_id: None,
            plan,
            actions: Vec::new(),
            requeued: Vec::new(),
            violations: Vec::new(),
        }
    }
}

/// The first step whose outputs are absent. Later steps follow from it.
fn resume_step(transcript: &[TranscriptSegment], frame_refs: &[String]) -> PipelineStep {
    if transcript.is_empty() {
        PipelineStep::Transcription
    } else if frame_refs.is_empty() {
        PipelineStep::FrameExtraction
    } else {
        PipelineStep::Rendering
    }
}

impl HealthMonitor {
    fn plan_recovery(
        &self,
        conn: &Connection,
        job: &JobRow,
        now: DateTime<Utc>,
    ) -> std::result::Result<RecoveryPlan, DatabaseError> {
        let live = work_unit_repo::list_live_by_job(conn, &job.id)?;
        let mut plan = RecoveryPlan {
            stalled_units: live
                .iter()
                .filter(|u| self.stall_of(u, now).is_some())
                .map(|u| u.id.clone())
                .collect(),
            reopen_job: job.status == JobStatus::Failed,
            ..Default::default()
        };

        if job.status == JobStatus::Completed {
            plan.missing_steps = verify_job(job)
                .missing_steps
                .into_iter()
                .filter(|step| !live.iter().any(|u| u.chunk_id.is_none() && u.step == *step))
                .collect();
            return Ok(plan);
        }

        if job.chunked {
            for chunk in chunk_repo::list_by_job(conn, &job.id)? {
                let queued = live
                    .iter()
                    .any(|u| u.chunk_id.as_deref() == Some(chunk.id.as_str()));
                match chunk.status {
                    ChunkStatus::Failed => plan.failed_chunks.push(chunk.id),
                    ChunkStatus::Pending | ChunkStatus::Processing if !queued => {
                        plan.resume.push(ResumePoint {
                            step: resume_step(&chunk.transcript, &chunk.frame_refs),
                            chunk_id: chunk.id,
                        })
                    }
                    _ => {}
                }
            }
        } else if job.status == JobStatus::Failed && live.is_empty() {
            plan.missing_steps
                .push(resume_step(&job.transcript, &job.frame_refs));
        }
        Ok(plan)
    }

    pub fn recover(&self, job_id: &str) -> Result<RecoveryReport> {
        self.recover_at(job_id, Utc::now())
    }

    /// Plans recovery, proposes it as a `recover_outputs` frame, and runs
    /// it if the frame is approved.
    pub fn recover_at(&self, job_id: &str, now: DateTime<Utc>) -> Result<RecoveryReport> {
        let span = tracing::info_span!("recover", job_id = %job_id);
        let _guard = span.enter();

        let job = self.load_job(job_id)?;
        let plan = self.db.with_conn(|c| self.plan_recovery(c, &job, now))?;
        if plan.is_empty() {
            log::info!("Job {} has nothing to recover", job_id);
            return Ok(RecoveryReport::new(job_id, RecoveryOutcome::NothingToRecover, plan));
        }
        if job.source_ref.is_none() {
            log::error!("Job {} cannot be recovered: no source reference", job_id);
            let mut report = RecoveryReport::new(job_id, RecoveryOutcome::Unrecoverable, plan);
            report
                .actions
                .push("source reference missing; outputs cannot be regenerated".to_string());
            return Ok(report);
        }

        let request = FrameRequest::new(
            FrameType::Recovery,
            RECOVER_OPERATION,
            EntityRef::job(job_id),
            serde_json::to_value(&plan)?,
            INITIATOR,
        );
        let frame = self.governor.create_frame_at(request, now)?;
        match frame.status {
            ApprovalStatus::Approved => self.execute(job_id, &frame.frame_id, now),
            ApprovalStatus::Pending => {
                log::info!("Recovery of job {} waits on frame {}", job_id, frame.frame_id);
                let mut report = RecoveryReport::new(job_id, RecoveryOutcome::AwaitingApproval, plan);
                report.frame_id = Some(frame.frame_id);
                Ok(report)
            }
            _ => {
                log::warn!("Recovery of job {} blocked by frame {}", job_id, frame.frame_id);
                let mut report = RecoveryReport::new(job_id, RecoveryOutcome::Blocked, plan);
                report.frame_id = Some(frame.frame_id);
                report.violations = frame.violations;
                Ok(report)
            }
        }
    }

    /// Runs a recovery whose frame a human has approved.
    pub(crate) fn apply_recovery(&self, job_id: &str, frame_id: &str) -> Result<RecoveryReport> {
        self.execute(job_id, frame_id, Utc::now())
    }

    fn execute(&self, job_id: &str, frame_id: &str, now: DateTime<Utc>) -> Result<RecoveryReport> {
        let (report, events) = self.db.with_tx(|conn| -> Result<(RecoveryReport, Vec<PipelineEvent>)> {
            authorize_job_operation(conn, frame_id, RECOVER_OPERATION, job_id)?;
            let job = job_repo::find_by_id(conn, job_id)?
                .ok_or_else(|| ChunkflowError::not_found(format!("job {job_id}")))?;
            let plan = self.plan_recovery(conn, &job, now)?;
            let mut events = Vec::new();
            let mut actions = Vec::new();
            let mut requeued = Vec::new();

            for unit_id in &plan.stalled_units {
                let Some(unit) = work_unit_repo::find_by_id(conn, unit_id)? else {
                    continue;
                };
                if !work_unit_repo::finish(
                    conn,
                    &unit.id,
                    WorkUnitStatus::Failed,
                    Some("stalled past its SLA"),
                    now,
                )? {
                    continue;
                }
                let retry = NewWorkUnit {
                    job_id: unit.job_id.clone(),
                    chunk_id: unit.chunk_id.clone(),
                    step: unit.step,
                    retry_count: unit.retry_count + 1,
                    requires_approval: false,
                    unit_duration_seconds: unit.unit_duration_seconds,
                };
                let (row, _) = queue_in(conn, &retry, now, &mut events)?;
                actions.push(format!(
                    "failed stalled {} unit {} and queued attempt {}",
                    unit.step,
                    unit.id,
                    row.retry_count + 1
                ));
                requeued.push(row);
            }

            for chunk_id in &plan.failed_chunks {
                if !chunk_repo::transition_status(
                    conn,
                    chunk_id,
                    &[ChunkStatus::Failed],
                    ChunkStatus::Pending,
                    None,
                    now,
                )? {
                    continue;
                }
                let Some(chunk) = chunk_repo::find_by_id(conn, chunk_id)? else {
                    continue;
                };
                let step = resume_step(&chunk.transcript, &chunk.frame_refs);
                let (row, _) = queue_in(conn, &chunk_unit(&chunk, step), now, &mut events)?;
                actions.push(format!("reset failed chunk {} to {}", chunk_id, step));
                requeued.push(row);
            }

            for point in &plan.resume {
                let Some(chunk) = chunk_repo::find_by_id(conn, &point.chunk_id)? else {
                    continue;
                };
                let (row, _) = queue_in(conn, &chunk_unit(&chunk, point.step), now, &mut events)?;
                actions.push(format!("resumed chunk {} at {}", point.chunk_id, point.step));
                requeued.push(row);
            }

            for step in &plan.missing_steps {
                let unit = NewWorkUnit {
                    job_id: job_id.to_string(),
                    chunk_id: None,
                    step: *step,
                    retry_count: 0,
                    requires_approval: false,
                    unit_duration_seconds: (job.duration_seconds > 0.0)
                        .then_some(job.duration_seconds),
                };
                let (row, _) = queue_in(conn, &unit, now, &mut events)?;
                actions.push(format!("queued {} to regenerate missing outputs", step));
                requeued.push(row);
            }

            if requeued.is_empty() {
                actions.push("no work could be queued".to_string());
                let mut report = RecoveryReport::new(job_id, RecoveryOutcome::Unrecoverable, plan);
                report.frame_id = Some(frame_id.to_string());
                report.actions = actions;
                return Ok((report, events));
            }

            if job.status == JobStatus::Failed || !plan.failed_chunks.is_empty() {
                let failed = if job.chunked {
                    chunk_repo::completion_counts(conn, job_id)?.failed
                } else {
                    0
                };
                job_repo::reopen(conn, job_id, failed, now)?;
                actions.push(format!("reopened job {job_id}"));
            }

            let mut steps: Vec<PipelineStep> = Vec::new();
            for unit in &requeued {
                if !steps.contains(&unit.step) {
                    steps.push(unit.step);
                }
            }
            let event = PipelineEvent::RecoveryRequested {
                job_id: job_id.to_string(),
                frame_id: frame_id.to_string(),
                steps,
            };
            EventBus::record(conn, &event, now)?;
            events.push(event);

            let mut report = RecoveryReport::new(job_id, RecoveryOutcome::Requeued, plan);
            report.frame_id = Some(frame_id.to_string());
            report.actions = actions;
            report.requeued = requeued;
            Ok((report, events))
        })?;

        for action in &report.actions {
            log::info!("Recovery of job {}: {}", job_id, action);
        }
        self.events.publish(events);
        Ok(report)
    }
}

fn chunk_unit(chunk: &chunk_repo::ChunkRow, step: PipelineStep) -> NewWorkUnit {
    NewWorkUnit {
        job_id: chunk.job_id.clone(),
        chunk_id: Some(chunk.id.clone()),
        step,
        retry_count: 0,
        requires_approval: false,
        unit_duration_seconds: Some(chunk.duration_seconds()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::chunk_repo::tests::sample_chunk;
    use crate::db::frame_repo;
    use crate::db::job_repo::tests::t0;
    use crate::health::tests::{monitor, running_unit};
    use chrono::Duration;

    fn complete_without_data(monitor_db: &crate::db::Database, job_id: &str) {
        monitor_db
            .with_conn(|c| job_repo::set_status(c, job_id, JobStatus::Completed, None, t0()))
            .unwrap();
    }

    #[test]
    fn test_healthy_job_needs_nothing() {
        let (_db, monitor) = monitor();
        let report = monitor.recover_at("j", t0()).unwrap();
        assert_eq!(report.outcome, RecoveryOutcome::NothingToRecover);
        assert!(report.frame_id.is_none());
    }

    #[test]
    fn test_missing_outputs_are_requeued() {
        let (db, monitor) = monitor();
        complete_without_data(&db, "j");

        let report = monitor.recover_at("j", t0()).unwrap();
        assert_eq!(report.outcome, RecoveryOutcome::Requeued);
        let steps: Vec<_> = report.requeued.iter().map(|u| u.step).collect();
        assert_eq!(steps, vec![PipelineStep::Transcription, PipelineStep::FrameExtraction]);
        assert!(report.requeued.iter().all(|u| u.chunk_id.is_none()));

        let frame = monitor
            .governor
            .find_frame(report.frame_id.as_deref().unwrap())
            .unwrap();
        assert_eq!(frame.frame_type, FrameType::Recovery);
        assert_eq!(frame.approved_by.as_deref(), Some("auto:output_recovery"));

        let outbox = monitor.events.drain(100).unwrap();
        assert!(outbox
            .iter()
            .any(|e| matches!(e.event, PipelineEvent::RecoveryRequested { .. })));

        // The job is still completed; recovery alone does not claim success.
        let verification = monitor.verify_outputs("j").unwrap();
        assert!(!verification.is_complete());

        // Queued work is not planned twice.
        let again = monitor.recover_at("j", t0()).unwrap();
        assert_eq!(again.outcome, RecoveryOutcome::NothingToRecover);
    }

    #[test]
    fn test_job_without_source_is_unrecoverable() {
        let (db, monitor) = monitor();
        db.with_conn(|c| {
            job_repo::insert(c, &JobRow::new("orphan", None, None, 0.0, t0()))?;
            job_repo::set_status(c, "orphan", JobStatus::Completed, None, t0())
        })
        .unwrap();

        let report = monitor.recover_at("orphan", t0()).unwrap();
        assert_eq!(report.outcome, RecoveryOutcome::Unrecoverable);
        assert!(report.requeued.is_empty());
        let frames = db
            .with_conn(|c| frame_repo::list_for_entity(c, &EntityRef::job("orphan")))
            .unwrap();
        assert!(frames.is_empty());
    }

    #[test]
    fn test_stalled_unit_is_retried_one_level_down() {
        let (db, monitor) = monitor();
        let stalled = running_unit(&db, None, PipelineStep::Transcription);
        let later = t0() + Duration::minutes(20);

        let report = monitor.recover_at("j", later).unwrap();
        assert_eq!(report.outcome, RecoveryOutcome::Requeued);
        assert_eq!(report.plan.stalled_units, vec![stalled.id.clone()]);
        assert_eq!(report.requeued[0].retry_count, 1);

        let old = db
            .with_conn(|c| work_unit_repo::find_by_id(c, &stalled.id))
            .unwrap()
            .unwrap();
        assert_eq!(old.status, WorkUnitStatus::Failed);
    }

    #[test]
    fn test_locked_job_blocks_recovery() {
        let (db, monitor) = monitor();
        complete_without_data(&db, "j");
        db.with_conn(|c| job_repo::set_governance_lock(c, "j", true, t0()))
            .unwrap();

        let report = monitor.recover_at("j", t0()).unwrap();
        assert_eq!(report.outcome, RecoveryOutcome::Blocked);
        assert!(report.requeued.is_empty());
        assert!(report
            .violations
            .iter()
            .any(|v| v.constraint_name == "governance_lock"));
    }

    #[test]
    fn test_deferred_recovery_requires_its_approved_frame() {
        let (db, monitor) = monitor();
        complete_without_data(&db, "j");

        let err = monitor.apply_recovery("j", "no-such-frame").unwrap_err();
        assert!(err.is_conflict());
        assert!(db
            .with_conn(|c| work_unit_repo::list_live_by_job(c, "j"))
            .unwrap()
            .is_empty());

        let report = monitor.recover_at("j", t0()).unwrap();
        let frame_id = report.frame_id.unwrap();
        let err = monitor.apply_recovery("other", &frame_id).unwrap_err();
        assert!(err.is_conflict());

        db.with_conn(|c| job_repo::set_governance_lock(c, "j", true, t0()))
            .unwrap();
        let err = monitor.apply_recovery("j", &frame_id).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_failed_chunk_is_reset_and_job_reopened() {
        let (db, monitor) = monitor();
        db.with_conn(|c| {
            job_repo::record_plan(
                c,
                "j",
                &job_repo::PlanUpdate {
                    chunked: true,
                    chunk_count: 2,
                    duration_seconds: 1200.0,
                    duration_estimated: false,
                    cost_estimate: 1.0,
                },
                t0(),
            )?;
            chunk_repo::insert(c, &sample_chunk("j", 0, 2))?;
            chunk_repo::insert(c, &sample_chunk("j", 1, 2))?;
            chunk_repo::transition_status(c, "j-c0", &[ChunkStatus::Pending], ChunkStatus::Completed, None, t0())?;
            let seg = TranscriptSegment {
                start: 0.0,
                end: 3.0,
                text: "partial".to_string(),
            };
            chunk_repo::append_outputs(c, "j-c1", &[seg], &[], 0, t0())?;
            chunk_repo::transition_status(c, "j-c1", &[ChunkStatus::Pending], ChunkStatus::Failed, Some("boom"), t0())?;
            job_repo::increment_failed_chunks(c, "j", t0())?;
            job_repo::set_status(c, "j", JobStatus::Failed, Some("chunk failed"), t0())
        })
        .unwrap();

        let report = monitor.recover_at("j", t0()).unwrap();
        assert_eq!(report.outcome, RecoveryOutcome::Requeued);
        assert_eq!(report.requeued.len(), 1);
        assert_eq!(report.requeued[0].chunk_id.as_deref(), Some("j-c1"));
        assert_eq!(report.requeued[0].step, PipelineStep::FrameExtraction);

        let job = db.with_conn(|c| job_repo::find_by_id(c, "j")).unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.failed_chunks, 0);
        assert!(job.error.is_none());
        let chunk = db.with_conn(|c| chunk_repo::find_by_id(c, "j-c1")).unwrap().unwrap();
        assert_eq!(chunk.status, ChunkStatus::Pending);
    }
}
