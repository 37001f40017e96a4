//! Individual state rules. Each one inspects persisted state only, never the
//! proposed state, so a race between intent and reality is caught.

use serde_json::{json, Value};

use crate::db::job_repo::JobRow;
use crate::db::EntitySnapshot;
use crate::model::{ConstraintStatus, Severity};

pub const FALSE_FAILURE_GUARD: &str = "false_failure_guard";
pub const GOVERNANCE_LOCK: &str = "governance_lock";
pub const APPROVAL_PREREQUISITE: &str = "approval_prerequisite";
pub const UNRESOLVED_PRIOR_VIOLATION: &str = "unresolved_prior_violation";

/// A rule breach before it is persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub constraint_name: &'static str,
    pub category: &'static str,
    pub severity: Severity,
    pub message: String,
    pub expected_state: Value,
    pub actual_state: Value,
}

/// Operations that would discard or condemn an entity's results.
pub fn is_failure_operation(operation: &str) -> bool {
    let op = operation.to_ascii_lowercase();
    op.contains("fail") || op.contains("reject")
}

pub fn is_claim_operation(operation: &str) -> bool {
    operation.to_ascii_lowercase().contains("claim")
}

/// Failing an entity that already holds both frames and a transcript would
/// mask finished work as a failure.
pub fn false_failure_guard(entity: &EntitySnapshot, operation: &str) -> Option<Finding> {
    if !is_failure_operation(operation) {
        return None;
    }
    let (frames, segments) = entity.derivative_counts()?;
    if frames == 0 || segments == 0 {
        return None;
    }
    Some(Finding {
        constraint_name: FALSE_FAILURE_GUARD,
        category: "race_condition",
        severity: Severity::Critical,
        message: format!(
            "'{operation}' would discard {frames} frame refs and {segments} transcript segments"
        ),
        expected_state: json!({"frame_refs": 0, "transcript_segments": 0}),
        actual_state: json!({"frame_refs": frames, "transcript_segments": segments}),
    })
}

pub fn governance_lock(owner: &JobRow) -> Option<Finding> {
    if !owner.governance_locked {
        return None;
    }
    Some(Finding {
        constraint_name: GOVERNANCE_LOCK,
        category: "governance",
        severity: Severity::Critical,
        message: format!("job {} is under a governance lock", owner.id),
        expected_state: json!({"governance_locked": false}),
        actual_state: json!({"governance_locked": true}),
    })
}

/// Claiming a unit that needs approval requires a linked approval frame.
pub fn approval_prerequisite(entity: &EntitySnapshot, operation: &str) -> Option<Finding> {
    let EntitySnapshot::WorkUnit(unit) = entity else {
        return None;
    };
    if !is_claim_operation(operation) || !unit.requires_approval || unit.approval_frame_id.is_some()
    {
        return None;
    }
    Some(Finding {
        constraint_name: APPROVAL_PREREQUISITE,
        category: "approval",
        severity: Severity::Critical,
        message: format!("work unit {} requires approval before it can be claimed", unit.id),
        expected_state: json!({"approval_frame_id": "<linked frame>"}),
        actual_state: json!({"approval_frame_id": null}),
    })
}

pub fn unresolved_prior_violation(owner: &JobRow) -> Option<Finding> {
    if owner.constraint_status != ConstraintStatus::Violated {
        return None;
    }
    Some(Finding {
        constraint_name: UNRESOLVED_PRIOR_VIOLATION,
        category: "governance",
        severity: Severity::Error,
        message: format!("job {} has unresolved constraint violations", owner.id),
        expected_state: json!({"constraint_status": ConstraintStatus::Valid}),
        actual_state: json!({"constraint_status": ConstraintStatus::Violated}),
    })
}

/// Runs every rule. `owner` is the job owning the entity (the entity itself
/// for a job).
pub fn evaluate(entity: &EntitySnapshot, owner: Option<&JobRow>, operation: &str) -> Vec<Finding> {
    let mut findings = Vec::new();
    findings.extend(false_failure_guard(entity, operation));
    if let Some(owner) = owner {
        findings.extend(governance_lock(owner));
    }
    findings.extend(approval_prerequisite(entity, operation));
    if let Some(owner) = owner {
        findings.extend(unresolved_prior_violation(owner));
    }
    findings
}
