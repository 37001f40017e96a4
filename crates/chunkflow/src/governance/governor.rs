//! Execution frame lifecycle: creation with gating and constraint checks,
//! human decisions, and expiry.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::Serialize;
use serde_json::Value;

use super::gates::GateRegistry;
use crate::constraints::ConstraintChecker;
use crate::db::frame_repo::{self, FrameRow};
use crate::db::transition_repo::{self, TransitionRow};
use crate::db::violation_repo::{self, ViolationRow};
use crate::db::{job_repo, Database, EntitySnapshot};
use crate::error::{ChunkflowError, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::model::{ApprovalStatus, ConstraintStatus, Decision, EntityRef, EntityType, FrameType};

/// A proposed state transition.
#[derive(Debug, Clone, PartialEq)]
pub struct FrameRequest {
    pub frame_type: FrameType,
    pub operation: String,
    pub target: EntityRef,
    pub proposed_state: Value,
    pub initiator: String,
    /// Annotation only.
    pub metadata: Value,
}

impl FrameRequest {
    pub fn new(
        frame_type: FrameType,
        operation: impl Into<String>,
        target: EntityRef,
        proposed_state: Value,
        initiator: impl Into<String>,
    ) -> Self {
        Self {
            frame_type,
            operation: operation.into(),
            target,
            proposed_state,
            initiator: initiator.into(),
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// What `create_frame` decided.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameOutcome {
    pub frame_id: String,
    pub requires_approval: bool,
    pub auto_approved: bool,
    pub status: ApprovalStatus,
    pub violations: Vec<ViolationRow>,
    pub gate: Option<String>,
    pub executed: bool,
}

impl FrameOutcome {
    pub fn is_approved(&self) -> bool {
        self.status == ApprovalStatus::Approved
    }

    pub fn is_rejected(&self) -> bool {
        self.status == ApprovalStatus::Rejected
    }
}

enum DecisionResult {
    Decided(Box<FrameRow>, PipelineEvent),
    Expired,
}

#[derive(Clone)]
pub struct FrameGovernor {
    db: Database,
    checker: ConstraintChecker,
    ttl: Duration,
    events: EventBus,
}

impl FrameGovernor {
    pub fn new(db: Database, ttl_seconds: i64, events: EventBus) -> Self {
        Self {
            db,
            checker: ConstraintChecker,
            ttl: Duration::seconds(ttl_seconds),
            events,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub fn create_frame(&self, request: FrameRequest) -> Result<FrameOutcome> {
        self.create_frame_at(request, Utc::now())
    }

    /// Creates a frame, its constraint check and its violations in one
    /// transaction.
    pub fn create_frame_at(&self, request: FrameRequest, now: DateTime<Utc>) -> Result<FrameOutcome> {
        let span = tracing::info_span!(
            "create_frame",
            operation = %request.operation,
            target = %request.target
        );
        let _guard = span.enter();

        if request.operation.trim().is_empty() {
            return Err(ChunkflowError::Validation(
                "frame operation must not be empty".to_string(),
            ));
        }
        if request.initiator.trim().is_empty() {
            return Err(ChunkflowError::Validation(
                "frame initiator must not be empty".to_string(),
            ));
        }

        let (outcome, events) = self
            .db
            .with_tx(|conn| self.create_frame_in(conn, &request, now))?;
        self.events.publish(events);
        Ok(outcome)
    }

    /// Same as [`create_frame_at`](Self::create_frame_at) on the caller's
    /// transaction. Events are recorded in the outbox and returned for the
    /// caller to publish after commit.
    pub(crate) fn create_frame_in(
        &self,
        conn: &Connection,
        request: &FrameRequest,
        now: DateTime<Utc>,
    ) -> Result<(FrameOutcome, Vec<PipelineEvent>)> {
        let frame_id = uuid::Uuid::new_v4().to_string();
        let snapshot = EntitySnapshot::load(conn, &request.target)?;
        let current = snapshot.as_ref().map(EntitySnapshot::to_json).transpose()?;

        let decision = GateRegistry::load(conn)?.decide(
            &request.operation,
            request.target.entity_type,
            current.as_ref(),
        );
        let report = self.checker.check(
            conn,
            &request.target,
            &request.operation,
            Some(&frame_id),
            now,
        )?;

        let status = if !report.valid {
            ApprovalStatus::Rejected
        } else if decision.is_pending() {
            ApprovalStatus::Pending
        } else {
            ApprovalStatus::Approved
        };
        let approved = status == ApprovalStatus::Approved;
        let approver = approved.then(|| format!("auto:{}", decision.gate_name().unwrap_or("ungated")));
        let notes = (status == ApprovalStatus::Rejected).then(|| critical_summary(&report.violations));

        let frame = FrameRow {
            id: frame_id.clone(),
            frame_type: request.frame_type,
            initiator: request.initiator.clone(),
            target: request.target.clone(),
            operation: request.operation.clone(),
            proposed_state: request.proposed_state.clone(),
            approval_status: status,
            requires_approval: decision.requires_approval(),
            auto_approved: approved,
            gate_name: decision.gate_name().map(str::to_string),
            violations: report.violations.clone(),
            executed: approved,
            executed_at: approved.then_some(now),
            approved_by: approver.clone(),
            approved_at: approved.then_some(now),
            notes: notes.clone(),
            metadata: request.metadata.clone(),
            created_at: now,
            expires_at: now + self.ttl,
        };
        frame_repo::insert(conn, &frame)?;

        if approved {
            record_transition(conn, &frame, current.unwrap_or(Value::Null), now)?;
        }

        let target = request.target.to_string();
        let mut events = vec![PipelineEvent::FrameCreated {
            frame_id: frame_id.clone(),
            target: target.clone(),
            operation: request.operation.clone(),
            status,
        }];
        match status {
            ApprovalStatus::Approved => events.push(PipelineEvent::FrameApproved {
                frame_id: frame_id.clone(),
                target,
                operation: request.operation.clone(),
                approver: approver.unwrap_or_default(),
            }),
            ApprovalStatus::Rejected => events.push(PipelineEvent::FrameRejected {
                frame_id: frame_id.clone(),
                target,
                operation: request.operation.clone(),
                reason: notes.unwrap_or_default(),
            }),
            _ => {}
        }
        for event in &events {
            EventBus::record(conn, event, now)?;
        }

        match status {
            ApprovalStatus::Rejected => log::warn!(
                "Frame {} for '{}' on {} rejected by constraints",
                frame_id,
                request.operation,
                request.target
            ),
            ApprovalStatus::Pending => log::info!(
                "Frame {} for '{}' on {} awaiting approval (gate {})",
                frame_id,
                request.operation,
                request.target,
                decision.gate_name().unwrap_or("-")
            ),
            _ => log::debug!(
                "Frame {} for '{}' on {} approved",
                frame_id,
                request.operation,
                request.target
            ),
        }

        let outcome = FrameOutcome {
            frame_id,
            requires_approval: decision.requires_approval(),
            auto_approved: approved,
            status,
            violations: report.violations,
            gate: decision.gate_name().map(str::to_string),
            executed: approved,
        };
        Ok((outcome, events))
    }

    pub fn approve_frame(
        &self,
        frame_id: &str,
        approver: &str,
        decision: Decision,
        notes: Option<&str>,
    ) -> Result<FrameRow> {
        self.approve_frame_at(frame_id, approver, decision, notes, Utc::now())
    }

    /// Applies a human decision to a pending frame.
    ///
    /// Fails with `Conflict` when the frame is no longer pending. A frame
    /// past its window is moved to `expired` (and that change is kept)
    /// before `FrameExpired` is returned.
    pub fn approve_frame_at(
        &self,
        frame_id: &str,
        approver: &str,
        decision: Decision,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<FrameRow> {
        if approver.trim().is_empty() {
            return Err(ChunkflowError::Validation(
                "approver must not be empty".to_string(),
            ));
        }

        let result = self.db.with_tx(|conn| -> Result<DecisionResult> {
            let frame = frame_repo::find_by_id(conn, frame_id)?
                .ok_or_else(|| ChunkflowError::not_found(format!("frame {frame_id}")))?;
            if frame.approval_status != ApprovalStatus::Pending {
                return Err(ChunkflowError::Conflict(format!(
                    "frame {} is already {}",
                    frame_id, frame.approval_status
                )));
            }
            if now - frame.created_at > self.ttl {
                frame_repo::mark_expired(conn, frame_id)?;
                return Ok(DecisionResult::Expired);
            }

            let event = match decision {
                Decision::Approved => self.apply_approval(conn, &frame, approver, notes, now)?,
                Decision::Rejected => {
                    if !frame_repo::decide(conn, frame_id, ApprovalStatus::Rejected, approver, notes, now)? {
                        return Err(ChunkflowError::Conflict(format!(
                            "frame {frame_id} was decided concurrently"
                        )));
                    }
                    PipelineEvent::FrameRejected {
                        frame_id: frame.id.clone(),
                        target: frame.target.to_string(),
                        operation: frame.operation.clone(),
                        reason: notes
                            .map(str::to_string)
                            .unwrap_or_else(|| format!("rejected by {approver}")),
                    }
                }
            };
            EventBus::record(conn, &event, now)?;

            let updated = frame_repo::find_by_id(conn, frame_id)?
                .ok_or_else(|| ChunkflowError::not_found(format!("frame {frame_id}")))?;
            Ok(DecisionResult::Decided(Box::new(updated), event))
        })?;

        match result {
            DecisionResult::Decided(frame, event) => {
                log::info!(
                    "Frame {} {} by {}",
                    frame.id,
                    frame.approval_status,
                    approver
                );
                self.events.publish([event]);
                Ok(*frame)
            }
            DecisionResult::Expired => {
                log::warn!("Frame {} expired before a decision was made", frame_id);
                Err(ChunkflowError::FrameExpired {
                    frame_id: frame_id.to_string(),
                })
            }
        }
    }

    fn apply_approval(
        &self,
        conn: &Connection,
        frame: &FrameRow,
        approver: &str,
        notes: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<PipelineEvent> {
        let before = match EntitySnapshot::load(conn, &frame.target)? {
            Some(snapshot) => snapshot.to_json()?,
            None => Value::Null,
        };
        if !frame_repo::decide(conn, &frame.id, ApprovalStatus::Approved, approver, notes, now)? {
            return Err(ChunkflowError::Conflict(format!(
                "frame {} was decided concurrently",
                frame.id
            )));
        }

        let resolved = violation_repo::resolve_for_entity(conn, &frame.target, approver, now)?;
        if resolved > 0 {
            log::info!("Resolved {} violations on {}", resolved, frame.target);
        }
        record_transition(conn, frame, before, now)?;
        if frame.target.entity_type == EntityType::Job {
            job_repo::set_constraint_status(conn, &frame.target.id, ConstraintStatus::Valid, now)?;
        }

        Ok(PipelineEvent::FrameApproved {
            frame_id: frame.id.clone(),
            target: frame.target.to_string(),
            operation: frame.operation.clone(),
            approver: approver.to_string(),
        })
    }

    /// Expires every pending frame whose window has closed.
    pub fn expire_pending(&self) -> Result<usize> {
        self.expire_pending_at(Utc::now())
    }

    pub fn expire_pending_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self.db.with_conn(|c| frame_repo::expire_due(c, now))?;
        if expired > 0 {
            log::info!("Expired {} pending frames", expired);
        }
        Ok(expired)
    }

    pub fn find_frame(&self, frame_id: &str) -> Result<FrameRow> {
        self.db
            .with_conn(|c| frame_repo::find_by_id(c, frame_id))?
            .ok_or_else(|| ChunkflowError::not_found(format!("frame {frame_id}")))
    }

    /// Frames waiting for a human decision, oldest first.
    pub fn pending_frames(&self) -> Result<Vec<FrameRow>> {
        Ok(self.db.with_conn(frame_repo::list_pending)?)
    }
}

/// Loads the frame a deferred job operation runs under. The frame must be
/// approved and executed, must propose `operation` on this job, and the job
/// must not be locked; anything else is a conflict.
pub(crate) fn authorize_job_operation(
    conn: &Connection,
    frame_id: &str,
    operation: &str,
    job_id: &str,
) -> Result<FrameRow> {
    let frame = frame_repo::find_by_id(conn, frame_id)?
        .ok_or_else(|| ChunkflowError::Conflict(format!("frame {frame_id} does not exist")))?;
    if frame.approval_status != ApprovalStatus::Approved || !frame.executed {
        return Err(ChunkflowError::Conflict(format!(
            "frame {frame_id} is {}, not an approved execution",
            frame.approval_status
        )));
    }
    if frame.operation != operation || frame.target != EntityRef::job(job_id) {
        return Err(ChunkflowError::Conflict(format!(
            "frame {frame_id} covers {} on {}, not {operation} on job {job_id}",
            frame.operation, frame.target
        )));
    }
    let job = job_repo::find_by_id(conn, job_id)?
        .ok_or_else(|| ChunkflowError::not_found(format!("job {job_id}")))?;
    if job.governance_locked {
        return Err(ChunkflowError::Conflict(format!(
            "job {job_id} is under a governance lock"
        )));
    }
    Ok(frame)
}

fn record_transition(
    conn: &Connection,
    frame: &FrameRow,
    before: Value,
    now: DateTime<Utc>,
) -> Result<()> {
    transition_repo::insert(
        conn,
        &TransitionRow {
            id: uuid::Uuid::new_v4().to_string(),
            frame_id: frame.id.clone(),
            target: frame.target.clone(),
            operation: frame.operation.clone(),
            before_state: before,
            after_state: frame.proposed_state.clone(),
            created_at: now,
        },
    )?;
    Ok(())
}

fn critical_summary(violations: &[ViolationRow]) -> String {
    let names: Vec<&str> = violations
        .iter()
        .filter(|v| v.is_critical())
        .map(|v| v.constraint_name.as_str())
        .collect();
    format!("rejected by critical violations: {}", names.join(", "))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_gates;
    use crate::db::chunk_repo::{self, tests::sample_chunk};
    use crate::db::gate_repo;
    use crate::db::job_repo::tests::{sample_job, t0};
    use crate::model::TranscriptSegment;
    use serde_json::json;

    fn setup() -> (Database, FrameGovernor) {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|c| {
            gate_repo::seed_if_empty(c, &default_gates())?;
            job_repo::insert(c, &sample_job("j"))?;
            chunk_repo::insert(c, &sample_chunk("j", 0, 1))
        })
        .unwrap();
        let governor = FrameGovernor::new(db.clone(), 3600, EventBus::new(db.clone()));
        (db, governor)
    }

    fn request(operation: &str, target: EntityRef) -> FrameRequest {
        FrameRequest::new(
            FrameType::AiExecution,
            operation,
            target,
            json!({"status": "failed"}),
            "worker-1",
        )
    }

    #[test]
    fn test_ungated_operation_auto_approves_and_executes() {
        let (db, governor) = setup();
        let outcome = governor
            .create_frame_at(request("complete_step", EntityRef::chunk("j-c0")), t0())
            .unwrap();
        assert!(outcome.is_approved());
        assert!(outcome.executed);
        assert!(!outcome.requires_approval);
        assert!(outcome.gate.is_none());

        let frame = governor.find_frame(&outcome.frame_id).unwrap();
        assert_eq!(frame.approved_by.as_deref(), Some("auto:ungated"));
        let transitions = db
            .with_conn(|c| transition_repo::list_for_entity(c, &EntityRef::chunk("j-c0")))
            .unwrap();
        assert_eq!(transitions.len(), 1);
        assert_eq!(transitions[0].before_state["status"], "pending");
    }

    #[test]
    fn test_gated_operation_pends() {
        let (_db, governor) = setup();
        let outcome = governor
            .create_frame_at(request("mark_failed", EntityRef::chunk("j-c0")), t0())
            .unwrap();
        assert_eq!(outcome.status, ApprovalStatus::Pending);
        assert!(outcome.requires_approval);
        assert!(!outcome.executed);
        assert_eq!(outcome.gate.as_deref(), Some("failure_marking"));
        assert_eq!(governor.pending_frames().unwrap().len(), 1);
    }

    #[test]
    fn test_condition_gate_auto_approves_with_prefix() {
        let (_db, governor) = setup();
        let outcome = governor
            .create_frame_at(request("recover_outputs", EntityRef::job("j")), t0())
            .unwrap();
        assert!(outcome.auto_approved);
        assert!(outcome.requires_approval);
        let frame = governor.find_frame(&outcome.frame_id).unwrap();
        assert_eq!(frame.approved_by.as_deref(), Some("auto:output_recovery"));
    }

    #[test]
    fn test_critical_violation_beats_auto_approval() {
        let (db, governor) = setup();
        db.with_conn(|c| job_repo::set_governance_lock(c, "j", true, t0()))
            .unwrap();
        let outcome = governor
            .create_frame_at(request("recover_outputs", EntityRef::job("j")), t0())
            .unwrap();
        assert!(outcome.is_rejected());
        assert!(!outcome.executed);
        assert!(!outcome.auto_approved);
        assert_eq!(outcome.violations[0].constraint_name, "governance_lock");

        let frame = governor.find_frame(&outcome.frame_id).unwrap();
        assert!(!frame.executed);
        assert_eq!(frame.violations.len(), 1);
    }

    #[test]
    fn test_failure_marking_with_outputs_is_rejected() {
        let (db, governor) = setup();
        let segments: Vec<_> = (0..50)
            .map(|i| TranscriptSegment {
                start: i as f64,
                end: i as f64 + 1.0,
                text: "t".to_string(),
            })
            .collect();
        let frames: Vec<_> = (0..120).map(|i| format!("f{i}")).collect();
        db.with_conn(|c| job_repo::record_outputs(c, "j", &segments, &frames, 0, t0()))
            .unwrap();

        let outcome = governor
            .create_frame_at(request("mark_failed", EntityRef::job("j")), t0())
            .unwrap();
        assert!(outcome.is_rejected());
        assert!(outcome
            .violations
            .iter()
            .any(|v| v.constraint_name == "false_failure_guard" && v.is_critical()));
    }

    #[test]
    fn test_human_approval_resolves_violations() {
        let (db, governor) = setup();
        db.with_conn(|c| job_repo::set_constraint_status(c, "j", ConstraintStatus::Violated, t0()))
            .unwrap();
        let outcome = governor
            .create_frame_at(request("mark_failed", EntityRef::job("j")), t0())
            .unwrap();
        assert_eq!(outcome.status, ApprovalStatus::Pending);
        assert_eq!(outcome.violations.len(), 1);

        let frame = governor
            .approve_frame_at(
                &outcome.frame_id,
                "alice",
                Decision::Approved,
                Some("checked"),
                t0() + Duration::minutes(10),
            )
            .unwrap();
        assert_eq!(frame.approval_status, ApprovalStatus::Approved);
        assert!(frame.executed);
        assert_eq!(frame.approved_by.as_deref(), Some("alice"));

        let open = db
            .with_conn(|c| violation_repo::list_unresolved(c, &EntityRef::job("j")))
            .unwrap();
        assert!(open.is_empty());
        let job = db.with_conn(|c| job_repo::find_by_id(c, "j")).unwrap().unwrap();
        assert_eq!(job.constraint_status, ConstraintStatus::Valid);
    }

    #[test]
    fn test_rejection_leaves_violations() {
        let (db, governor) = setup();
        db.with_conn(|c| job_repo::set_constraint_status(c, "j", ConstraintStatus::Violated, t0()))
            .unwrap();
        let outcome = governor
            .create_frame_at(request("mark_failed", EntityRef::job("j")), t0())
            .unwrap();
        let frame = governor
            .approve_frame_at(&outcome.frame_id, "bob", Decision::Rejected, Some("no"), t0())
            .unwrap();
        assert_eq!(frame.approval_status, ApprovalStatus::Rejected);
        assert!(!frame.executed);
        assert_eq!(frame.notes.as_deref(), Some("no"));
        let open = db
            .with_conn(|c| violation_repo::list_unresolved(c, &EntityRef::job("j")))
            .unwrap();
        assert_eq!(open.len(), 1);
    }

    #[test]
    fn test_second_decision_conflicts() {
        let (_db, governor) = setup();
        let outcome = governor
            .create_frame_at(request("mark_failed", EntityRef::chunk("j-c0")), t0())
            .unwrap();
        governor
            .approve_frame_at(&outcome.frame_id, "alice", Decision::Approved, None, t0())
            .unwrap();
        let err = governor
            .approve_frame_at(&outcome.frame_id, "alice", Decision::Approved, None, t0())
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_late_approval_expires_frame() {
        let (_db, governor) = setup();
        let outcome = governor
            .create_frame_at(request("mark_failed", EntityRef::chunk("j-c0")), t0())
            .unwrap();
        let err = governor
            .approve_frame_at(
                &outcome.frame_id,
                "alice",
                Decision::Approved,
                None,
                t0() + Duration::minutes(61),
            )
            .unwrap_err();
        assert!(matches!(err, ChunkflowError::FrameExpired { .. }));

        let frame = governor.find_frame(&outcome.frame_id).unwrap();
        assert_eq!(frame.approval_status, ApprovalStatus::Expired);
        assert!(!frame.executed);

        let again = governor
            .approve_frame_at(&outcome.frame_id, "alice", Decision::Approved, None, t0())
            .unwrap_err();
        assert!(again.is_conflict());
    }

    #[test]
    fn test_expire_pending_sweep() {
        let (_db, governor) = setup();
        governor
            .create_frame_at(request("mark_failed", EntityRef::chunk("j-c0")), t0())
            .unwrap();
        assert_eq!(governor.expire_pending_at(t0() + Duration::minutes(30)).unwrap(), 0);
        assert_eq!(governor.expire_pending_at(t0() + Duration::minutes(61)).unwrap(), 1);
        assert!(governor.pending_frames().unwrap().is_empty());
    }

    #[test]
    fn test_empty_operation_is_validation_error() {
        let (_db, governor) = setup();
        let err = governor
            .create_frame_at(request(" ", EntityRef::job("j")), t0())
            .unwrap_err();
        assert!(matches!(err, ChunkflowError::Validation(_)));
    }

    #[test]
    fn test_events_are_recorded() {
        let (db, governor) = setup();
        governor
            .create_frame_at(request("mark_failed", EntityRef::chunk("j-c0")), t0())
            .unwrap();
        let drained = EventBus::new(db).drain(10).unwrap();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].event.kind(), "FrameCreated");
    }
}
