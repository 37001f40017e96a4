//! Operator-facing facade over the planner, governance, runner, merge and
//! health components.

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use serde_json::json;

use crate::config::Config;
use crate::db::chunk_repo::{self, ChunkRow};
use crate::db::frame_repo::FrameRow;
use crate::db::job_repo::{self, JobRow};
use crate::db::work_unit_repo::{self, WorkUnitRow};
use crate::db::{default_database_path, gate_repo, Database};
use crate::error::{ChunkflowError, ConfigError, Result};
use crate::events::EventBus;
use crate::governance::{FrameGovernor, FrameOutcome, FrameRequest};
use crate::health::{HealthMonitor, HealthReport, OutputVerification, RecoveryReport, RECOVER_OPERATION};
use crate::merge::{MergeOptions, MergeOutcome, Merger, MERGE_OPERATION};
use crate::model::{ApprovalStatus, Decision, EntityRef, EntityType, FrameType};
use crate::planner::{ChunkPlan, ChunkPlanner, PlanHints};
use crate::storage::{ArtifactStore, FileArtifactStore};
use crate::worker::runner::{apply_failure, FAIL_OPERATION};
use crate::worker::{AdvanceOutcome, StepExecutor, StepRunner, WorkerPool};

pub const UNIT_APPROVAL_OPERATION: &str = "approve_work_unit";

/// A job as submitted for processing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewJob {
    /// Generated when absent.
    pub id: Option<String>,
    pub source_ref: Option<String>,
    pub payload_bytes: Option<u64>,
    /// Known duration in seconds; 0 when it still has to be estimated.
    pub duration_seconds: f64,
}

/// What approving a frame set in motion.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "applied", rename_all = "snake_case")]
pub enum AppliedOperation {
    MarkedFailed { target: EntityRef },
    Merged { outcome: MergeOutcome },
    Recovered { report: RecoveryReport },
    UnitApproved { unit_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApprovalResult {
    pub frame: FrameRow,
    /// `None` for rejections and for operations that are audit records only.
    pub applied: Option<AppliedOperation>,
}

pub struct Orchestrator {
    db: Database,
    config: Config,
    events: EventBus,
    planner: ChunkPlanner,
    governor: FrameGovernor,
    merger: Merger,
    monitor: HealthMonitor,
    runner: StepRunner,
}

impl Orchestrator {
    /// Opens the configured database and artifact directory.
    pub fn open(config: Config, executor: Arc<dyn StepExecutor>) -> Result<Self> {
        let path = config
            .database_path
            .as_ref()
            .map(PathBuf::from)
            .or_else(default_database_path)
            .ok_or_else(|| ConfigError::Validation {
                message: "no database_path configured and no home directory found".to_string(),
            })?;
        let db = Database::open(&path)?;
        let store = Arc::new(FileArtifactStore::new(&config.artifact_directory));
        Self::with_parts(db, store, executor, config)
    }

    /// Assembles the components over an existing database and store. The
    /// configured gates replace the stored ones of the same name.
    pub fn with_parts(
        db: Database,
        store: Arc<dyn ArtifactStore>,
        executor: Arc<dyn StepExecutor>,
        config: Config,
    ) -> Result<Self> {
        db.with_tx(|conn| {
            for (position, gate) in config.governance.gates.iter().enumerate() {
                gate_repo::upsert(conn, gate, position as u32)?;
            }
            Ok::<_, ChunkflowError>(())
        })?;

        let events = EventBus::new(db.clone());
        let governor = FrameGovernor::new(
            db.clone(),
            config.governance.frame_ttl_seconds,
            events.clone(),
        );
        let planner = ChunkPlanner::new(db.clone(), config.planner.clone(), events.clone());
        let merger = Merger::new(
            db.clone(),
            store,
            governor.clone(),
            events.clone(),
            config.merge.frame_sample_rate_hz,
        );
        let monitor = HealthMonitor::new(db.clone(), &config.health, governor.clone(), events.clone());
        let runner = StepRunner::new(
            db.clone(),
            governor.clone(),
            merger.clone(),
            events.clone(),
            executor,
            config.worker.max_retries,
        );

        log::info!(
            "Orchestrator ready ({} gates, frame TTL {}s)",
            config.governance.gates.len(),
            config.governance.frame_ttl_seconds
        );

        Ok(Self {
            db,
            config,
            events,
            planner,
            governor,
            merger,
            monitor,
            runner,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn governor(&self) -> &FrameGovernor {
        &self.governor
    }

    pub fn runner(&self) -> &StepRunner {
        &self.runner
    }

    pub fn monitor(&self) -> &HealthMonitor {
        &self.monitor
    }

    /// A pool sized by the worker config, capped per job by
    /// `max_parallel_chunks`.
    pub fn worker_pool(&self) -> WorkerPool {
        WorkerPool::new(
            self.runner.clone(),
            self.config.worker.worker_count.max(1),
            self.config.planner.max_parallel_chunks,
        )
    }

    pub fn submit_job(&self, job: NewJob) -> Result<JobRow> {
        if job.duration_seconds.is_nan() || job.duration_seconds < 0.0 {
            return Err(ChunkflowError::Validation(format!(
                "duration must be a non-negative number of seconds, got {}",
                job.duration_seconds
            )));
        }
        if job.source_ref.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(ChunkflowError::Validation(
                "source_ref must not be empty".to_string(),
            ));
        }
        if job.id.as_deref().is_some_and(|s| s.trim().is_empty()) {
            return Err(ChunkflowError::Validation("job id must not be empty".to_string()));
        }
        let payload_bytes = job
            .payload_bytes
            .map(i64::try_from)
            .transpose()
            .map_err(|_| ChunkflowError::Validation("payload_bytes is too large".to_string()))?;

        let id = job.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let row = JobRow::new(&id, job.source_ref, payload_bytes, job.duration_seconds, Utc::now());
        self.db.with_conn(|c| job_repo::insert(c, &row)).map_err(|e| {
            if e.is_unique_violation() {
                ChunkflowError::Conflict(format!("job {id} already exists"))
            } else {
                e.into()
            }
        })?;
        log::info!("Submitted job {}", id);
        Ok(row)
    }

    pub fn job(&self, job_id: &str) -> Result<JobRow> {
        self.db
            .with_conn(|c| job_repo::find_by_id(c, job_id))?
            .ok_or_else(|| ChunkflowError::not_found(format!("job {job_id}")))
    }

    pub fn chunks(&self, job_id: &str) -> Result<Vec<ChunkRow>> {
        Ok(self.db.with_conn(|c| chunk_repo::list_by_job(c, job_id))?)
    }

    pub fn work_units(&self, job_id: &str) -> Result<Vec<WorkUnitRow>> {
        Ok(self
            .db
            .with_conn(|c| work_unit_repo::list_live_by_job(c, job_id))?)
    }

    pub fn plan_chunks(&self, job_id: &str, hints: &PlanHints) -> Result<ChunkPlan> {
        self.planner.plan_chunks(job_id, hints)
    }

    /// Queues the first step of every pending chunk.
    pub fn start_job(&self, job_id: &str) -> Result<Vec<WorkUnitRow>> {
        self.runner.start_job(job_id)
    }

    pub fn create_frame(&self, request: FrameRequest) -> Result<FrameOutcome> {
        self.governor.create_frame(request)
    }

    pub fn pending_frames(&self) -> Result<Vec<FrameRow>> {
        self.governor.pending_frames()
    }

    /// Records a human decision and, on approval, carries out the operation
    /// the frame proposed.
    pub fn approve_frame(
        &self,
        frame_id: &str,
        approver: &str,
        decision: Decision,
        notes: Option<&str>,
    ) -> Result<ApprovalResult> {
        let frame = self.governor.approve_frame(frame_id, approver, decision, notes)?;
        if frame.approval_status != ApprovalStatus::Approved {
            return Ok(ApprovalResult {
                frame,
                applied: None,
            });
        }
        let applied = self.apply(&frame, approver)?;
        Ok(ApprovalResult { frame, applied })
    }

    fn apply(&self, frame: &FrameRow, approver: &str) -> Result<Option<AppliedOperation>> {
        let target = &frame.target;
        let applied = match frame.operation.as_str() {
            FAIL_OPERATION => {
                let error = frame
                    .proposed_state
                    .get("error")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| format!("marked failed by {approver}"));
                let now = Utc::now();
                self.db
                    .with_tx(|conn| apply_failure(conn, target, &error, now))?;
                log::warn!("{} marked failed by {}", target, approver);
                Some(AppliedOperation::MarkedFailed {
                    target: target.clone(),
                })
            }
            MERGE_OPERATION if target.entity_type == EntityType::Job => {
                let options: MergeOptions = serde_json::from_value(frame.proposed_state.clone())?;
                let outcome = self.merger.complete_approved(&target.id, &frame.id, options)?;
                Some(AppliedOperation::Merged { outcome })
            }
            RECOVER_OPERATION if target.entity_type == EntityType::Job => {
                let report = self.monitor.apply_recovery(&target.id, &frame.id)?;
                Some(AppliedOperation::Recovered { report })
            }
            UNIT_APPROVAL_OPERATION if target.entity_type == EntityType::WorkUnit => {
                self.link_unit_approval(&target.id, &frame.id)?;
                Some(AppliedOperation::UnitApproved {
                    unit_id: target.id.clone(),
                })
            }
            _ => None,
        };
        Ok(applied)
    }

    fn link_unit_approval(&self, unit_id: &str, frame_id: &str) -> Result<()> {
        if !self
            .db
            .with_conn(|c| work_unit_repo::link_approval(c, unit_id, frame_id))?
        {
            return Err(ChunkflowError::not_found(format!("work unit {unit_id}")));
        }
        log::info!("Unit {} approved by frame {}", unit_id, frame_id);
        Ok(())
    }

    /// Asks for the human approval a `requires_approval` unit needs before
    /// it can be claimed.
    pub fn request_unit_approval(&self, unit_id: &str, requester: &str) -> Result<FrameOutcome> {
        let unit = self
            .db
            .with_conn(|c| work_unit_repo::find_by_id(c, unit_id))?
            .ok_or_else(|| ChunkflowError::not_found(format!("work unit {unit_id}")))?;
        let outcome = self.governor.create_frame(FrameRequest::new(
            FrameType::HumanApproval,
            UNIT_APPROVAL_OPERATION,
            EntityRef::work_unit(unit_id),
            json!({"step": unit.step, "approval": "granted"}),
            requester,
        ))?;
        if outcome.is_approved() {
            self.link_unit_approval(unit_id, &outcome.frame_id)?;
        }
        Ok(outcome)
    }

    pub fn merge(&self, job_id: &str, options: MergeOptions) -> Result<MergeOutcome> {
        self.merger.merge(job_id, options)
    }

    pub fn check_health(&self) -> Result<HealthReport> {
        self.monitor.check_health()
    }

    pub fn verify_outputs(&self, job_id: &str) -> Result<OutputVerification> {
        self.monitor.verify_outputs(job_id)
    }

    pub fn recover(&self, job_id: &str) -> Result<RecoveryReport> {
        self.monitor.recover(job_id)
    }

    /// Administrative write; governance itself consults this flag.
    pub fn set_governance_lock(&self, job_id: &str, locked: bool) -> Result<()> {
        let now = Utc::now();
        if !self
            .db
            .with_conn(|c| job_repo::set_governance_lock(c, job_id, locked, now))?
        {
            return Err(ChunkflowError::not_found(format!("job {job_id}")));
        }
        log::warn!(
            "Governance lock on job {} {}",
            job_id,
            if locked { "set" } else { "cleared" }
        );
        Ok(())
    }

    pub fn expire_frames(&self) -> Result<usize> {
        self.governor.expire_pending()
    }

    /// Advances `units` and their follow-ups one at a time on this thread.
    pub fn run_units(&self, units: Vec<WorkUnitRow>) -> Result<Vec<AdvanceOutcome>> {
        let mut queue: VecDeque<WorkUnitRow> = units.into();
        let mut outcomes = Vec::new();
        while let Some(unit) = queue.pop_front() {
            let outcome = self.runner.advance(&unit.id)?;
            if let Some(next) = outcome.follow_up() {
                queue.push_back(next.clone());
            }
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Plans a job if it has never been planned, starts it, and runs it as
    /// far as it goes without human input.
    pub fn process_job(&self, job_id: &str) -> Result<JobRow> {
        let span = tracing::info_span!("process_job", job_id = %job_id);
        let _guard = span.enter();

        let job = self.job(job_id)?;
        if job.cost_estimate.is_none() {
            self.plan_chunks(job_id, &PlanHints::default())?;
        }
        let units = self.start_job(job_id)?;
        let outcomes = self.run_units(units)?;
        let waiting = outcomes
            .iter()
            .filter(|o| {
                matches!(
                    o,
                    AdvanceOutcome::AwaitingApproval { .. }
                        | AdvanceOutcome::FailureProposed {
                            status: ApprovalStatus::Pending,
                            ..
                        }
                )
            })
            .count();
        if waiting > 0 {
            log::info!("Job {} has {} steps waiting on approval", job_id, waiting);
        }
        self.job(job_id)
    }
}
