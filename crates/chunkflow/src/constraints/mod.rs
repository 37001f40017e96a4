//! Constraint checker.
//!
//! Evaluates the rules in [`rules`] against an entity's persisted state,
//! persists every finding as a violation, and keeps the owning job's
//! `constraint_status` in step with the result.

pub mod rules;

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::Serialize;

use crate::db::job_repo::{self, JobRow};
use crate::db::violation_repo::{self, ViolationRow};
use crate::db::{DatabaseError, EntitySnapshot};
use crate::model::{ConstraintStatus, EntityRef, Severity};

pub use rules::Finding;

/// Outcome of one check. `valid` is false only for critical violations.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConstraintReport {
    pub valid: bool,
    pub violations: Vec<ViolationRow>,
}

impl ConstraintReport {
    pub fn has_critical(&self) -> bool {
        self.violations.iter().any(ViolationRow::is_critical)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ConstraintChecker;

impl ConstraintChecker {
    /// Checks `operation` against `target` inside the caller's transaction.
    /// A target that cannot be loaded yields no violations.
    pub fn check(
        &self,
        conn: &Connection,
        target: &EntityRef,
        operation: &str,
        frame_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<ConstraintReport, DatabaseError> {
        let Some(entity) = EntitySnapshot::load(conn, target)? else {
            log::warn!("Constraint check on missing entity {}", target);
            return Ok(ConstraintReport {
                valid: true,
                violations: Vec::new(),
            });
        };
        let owner = owning_job(conn, &entity)?;

        let findings = rules::evaluate(&entity, owner.as_ref(), operation);
        let mut violations = Vec::with_capacity(findings.len());
        for finding in findings {
            let violation = ViolationRow {
                id: uuid::Uuid::new_v4().to_string(),
                frame_id: frame_id.map(str::to_string),
                target: target.clone(),
                constraint_name: finding.constraint_name.to_string(),
                category: finding.category.to_string(),
                severity: finding.severity,
                message: finding.message,
                expected_state: finding.expected_state,
                actual_state: finding.actual_state,
                resolved: false,
                resolved_by: None,
                resolved_at: None,
                created_at: now,
            };
            violation_repo::insert(conn, &violation)?;
            match violation.severity {
                Severity::Critical => log::warn!(
                    "Critical violation '{}' on {} for '{}': {}",
                    violation.constraint_name,
                    target,
                    operation,
                    violation.message
                ),
                _ => log::info!(
                    "Violation '{}' on {}: {}",
                    violation.constraint_name,
                    target,
                    violation.message
                ),
            }
            violations.push(violation);
        }

        if let Some(owner) = owner {
            let status = if violations.is_empty() {
                ConstraintStatus::Valid
            } else {
                ConstraintStatus::Violated
            };
            if owner.constraint_status != status {
                job_repo::set_constraint_status(conn, &owner.id, status, now)?;
            }
        }

        let valid = !violations.iter().any(ViolationRow::is_critical);
        Ok(ConstraintReport { valid, violations })
    }
}

fn owning_job(conn: &Connection, entity: &EntitySnapshot) -> Result<Option<JobRow>, DatabaseError> {
    match entity {
        EntitySnapshot::Job(job) => Ok(Some(job.clone())),
        other => job_repo::find_by_id(conn, other.owning_job_id()),
    }
}
