//! Health / recovery monitor.
//!
//! `check_health` is a read-only scan: it reports stale heartbeats, units
//! running past their SLA, orphaned queue entries and completed jobs without
//! data, but never changes any status. Corrective action happens only
//! through [`HealthMonitor::recover`], which is itself a governed operation.

pub mod recovery;
pub mod verify;

pub use recovery::{RecoveryOutcome, RecoveryPlan, RecoveryReport, RECOVER_OPERATION};
pub use verify::{verify_job, OutputVerification};

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::Serialize;

use crate::config::HealthConfig;
use crate::db::job_repo::{self, JobRow};
use crate::db::work_unit_repo::{self, WorkUnitRow};
use crate::db::{Database, DatabaseError};
use crate::error::{ChunkflowError, Result};
use crate::events::EventBus;
use crate::governance::FrameGovernor;
use crate::model::{EntityRef, JobStatus, Severity, WorkUnitStatus};
use crate::sla::{SlaTable, SlaWindow};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueKind {
    /// A processing job whose worker has gone quiet.
    StaleHeartbeat,
    /// A unit running longer than its SLA allows.
    StalledUnit,
    /// A live unit whose job already reached a terminal state.
    OrphanedUnit,
    /// A completed job without the outputs its status implies.
    MissingOutputs,
}

impl IssueKind {
    pub fn severity(&self) -> Severity {
        match self {
            IssueKind::StaleHeartbeat | IssueKind::StalledUnit => Severity::Critical,
            IssueKind::OrphanedUnit | IssueKind::MissingOutputs => Severity::Warn,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthIssue {
    pub kind: IssueKind,
    pub severity: Severity,
    pub entity: EntityRef,
    pub job_id: String,
    pub message: String,
    pub elapsed_seconds: Option<f64>,
    pub threshold_seconds: Option<f64>,
}

impl HealthIssue {
    fn new(kind: IssueKind, entity: EntityRef, job_id: &str, message: String) -> Self {
        Self {
            kind,
            severity: kind.severity(),
            entity,
            job_id: job_id.to_string(),
            message,
            elapsed_seconds: None,
            threshold_seconds: None,
        }
    }

    fn timed(mut self, elapsed: f64, threshold: f64) -> Self {
        self.elapsed_seconds = Some(elapsed);
        self.threshold_seconds = Some(threshold);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub checked_at: DateTime<Utc>,
    /// No critical issues.
    pub healthy: bool,
    pub issues: Vec<HealthIssue>,
    pub stalled_units: usize,
    pub stale_heartbeats: usize,
}

impl HealthReport {
    pub fn issues_of(&self, kind: IssueKind) -> impl Iterator<Item = &HealthIssue> {
        self.issues.iter().filter(move |i| i.kind == kind)
    }
}

fn seconds(duration: Duration) -> f64 {
    duration.num_milliseconds() as f64 / 1000.0
}

#[derive(Clone)]
pub struct HealthMonitor {
    db: Database,
    sla: SlaTable,
    heartbeat_stale: Duration,
    governor: FrameGovernor,
    events: EventBus,
}

impl HealthMonitor {
    pub fn new(
        db: Database,
        config: &HealthConfig,
        governor: FrameGovernor,
        events: EventBus,
    ) -> Self {
        Self {
            db,
            sla: SlaTable::new(config),
            heartbeat_stale: Duration::seconds(config.heartbeat_stale_seconds),
            governor,
            events,
        }
    }

    pub fn sla(&self) -> &SlaTable {
        &self.sla
    }

    /// Elapsed seconds and SLA window for a processing unit past its
    /// maximum.
    pub(crate) fn stall_of(&self, unit: &WorkUnitRow, now: DateTime<Utc>) -> Option<(f64, SlaWindow)> {
        if unit.status != WorkUnitStatus::Processing {
            return None;
        }
        let elapsed = seconds(now - unit.started_at?);
        let window = self.sla.window(unit.step, unit.unit_duration_seconds);
        (elapsed > window.max_seconds).then_some((elapsed, window))
    }

    pub fn check_health(&self) -> Result<HealthReport> {
        self.check_health_at(Utc::now())
    }

    pub fn check_health_at(&self, now: DateTime<Utc>) -> Result<HealthReport> {
        let span = tracing::info_span!("check_health");
        let _guard = span.enter();

        let issues = self.db.with_conn(|conn| self.scan(conn, now))?;
        let stalled_units = issues.iter().filter(|i| i.kind == IssueKind::StalledUnit).count();
        let stale_heartbeats = issues
            .iter()
            .filter(|i| i.kind == IssueKind::StaleHeartbeat)
            .count();
        let healthy = !issues.iter().any(|i| i.severity == Severity::Critical);

        if healthy {
            log::debug!("Health check passed with {} warnings", issues.len());
        } else {
            log::warn!(
                "Health check found {} stalled units and {} stale heartbeats",
                stalled_units,
                stale_heartbeats
            );
        }

        Ok(HealthReport {
            checked_at: now,
            healthy,
            issues,
            stalled_units,
            stale_heartbeats,
        })
    }

    fn scan(&self, conn: &Connection, now: DateTime<Utc>) -> std::result::Result<Vec<HealthIssue>, DatabaseError> {
        let mut issues = Vec::new();

        for job in job_repo::list_by_status(conn, JobStatus::Processing)? {
            let last = job.last_heartbeat.unwrap_or(job.updated_at);
            let age = now - last;
            if age > self.heartbeat_stale {
                issues.push(
                    HealthIssue::new(
                        IssueKind::StaleHeartbeat,
                        EntityRef::job(job.id.clone()),
                        &job.id,
                        format!(
                            "no heartbeat for {}s during {}",
                            age.num_seconds(),
                            job.current_step.as_deref().unwrap_or("-")
                        ),
                    )
                    .timed(seconds(age), seconds(self.heartbeat_stale)),
                );
            }
        }

        for status in [WorkUnitStatus::Pending, WorkUnitStatus::Processing] {
            for unit in work_unit_repo::list_by_status(conn, status)? {
                if let Some((elapsed, window)) = self.stall_of(&unit, now) {
                    issues.push(
                        HealthIssue::new(
                            IssueKind::StalledUnit,
                            EntityRef::work_unit(unit.id.clone()),
                            &unit.job_id,
                            format!(
                                "{} running {:.0}s, expected {:.0}s",
                                unit.step, elapsed, window.expected_seconds
                            ),
                        )
                        .timed(elapsed, window.max_seconds),
                    );
                }
                if let Some(reason) = orphan_reason(conn, &unit)? {
                    issues.push(HealthIssue::new(
                        IssueKind::OrphanedUnit,
                        EntityRef::work_unit(unit.id.clone()),
                        &unit.job_id,
                        reason,
                    ));
                }
            }
        }

        for job in job_repo::list_by_status(conn, JobStatus::Completed)? {
            let verification = verify_job(&job);
            if !verification.is_complete() {
                let missing: Vec<&str> =
                    verification.missing_steps.iter().map(|s| s.as_str()).collect();
                issues.push(HealthIssue::new(
                    IssueKind::MissingOutputs,
                    EntityRef::job(job.id.clone()),
                    &job.id,
                    format!("completed without outputs of {}", missing.join(", ")),
                ));
            }
        }

        Ok(issues)
    }

    /// Checks that a job holds the outputs its status claims.
    pub fn verify_outputs(&self, job_id: &str) -> Result<OutputVerification> {
        let job = self.load_job(job_id)?;
        let verification = verify_job(&job);
        if !verification.is_complete() {
            log::warn!(
                "Job {} is {} but lacks outputs of {:?}",
                job_id,
                job.status,
                verification.missing_steps
            );
        }
        Ok(verification)
    }

    fn load_job(&self, job_id: &str) -> Result<JobRow> {
        self.db
            .with_conn(|c| job_repo::find_by_id(c, job_id))?
            .ok_or_else(|| ChunkflowError::not_found(format!("job {job_id}")))
    }
}

/// A chunk-level unit outlives its job once the job is terminal. Job-level
/// units on a completed job are recovery re-runs and belong there.
fn orphan_reason(conn: &Connection, unit: &WorkUnitRow) -> std::result::Result<Option<String>, DatabaseError> {
    let Some(job) = job_repo::find_by_id(conn, &unit.job_id)? else {
        return Ok(Some(format!("job {} no longer exists", unit.job_id)));
    };
    let orphaned = match job.status {
        JobStatus::Failed => true,
        JobStatus::Completed => unit.chunk_id.is_some(),
        _ => false,
    };
    Ok(orphaned.then(|| format!("{} unit is live but job {} is {}", unit.step, job.id, job.status)))
}
