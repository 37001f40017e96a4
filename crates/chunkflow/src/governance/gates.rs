//! Gate matching and auto-approval.

use rusqlite::Connection;
use serde_json::Value;

use crate::db::{gate_repo, DatabaseError};
use crate::model::{ApprovalGate, EntityType};

/// How a gate lookup resolved for one operation.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    /// No gate matched; the operation proceeds.
    Ungated,
    /// A gate matched but does not require approval.
    Open { gate: String },
    /// Approval was required and every auto-approve condition held.
    AutoApproved { gate: String },
    /// A human has to decide.
    Pending { gate: String },
}

impl GateDecision {
    pub fn gate_name(&self) -> Option<&str> {
        match self {
            GateDecision::Ungated => None,
            GateDecision::Open { gate }
            | GateDecision::AutoApproved { gate }
            | GateDecision::Pending { gate } => Some(gate),
        }
    }

    pub fn requires_approval(&self) -> bool {
        matches!(
            self,
            GateDecision::AutoApproved { .. } | GateDecision::Pending { .. }
        )
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, GateDecision::Pending { .. })
    }
}

/// Active gates in evaluation order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GateRegistry {
    gates: Vec<ApprovalGate>,
}

impl GateRegistry {
    pub fn new(gates: Vec<ApprovalGate>) -> Self {
        Self {
            gates: gates.into_iter().filter(|g| g.active).collect(),
        }
    }

    /// Reads the active gates from the datastore.
    pub fn load(conn: &Connection) -> Result<Self, DatabaseError> {
        Ok(Self::new(gate_repo::list_active(conn)?))
    }

    pub fn gates(&self) -> &[ApprovalGate] {
        &self.gates
    }

    /// First gate matching both the operation and the entity type.
    pub fn find(&self, operation: &str, entity_type: EntityType) -> Option<&ApprovalGate> {
        self.gates.iter().find(|g| g.matches(operation, entity_type))
    }

    /// Resolves the gate outcome against the entity's current state. A gate
    /// requiring approval auto-approves only when it has conditions and all
    /// of them hold; `current` is `None` when the entity could not be loaded.
    pub fn decide(
        &self,
        operation: &str,
        entity_type: EntityType,
        current: Option<&Value>,
    ) -> GateDecision {
        let Some(gate) = self.find(operation, entity_type) else {
            return GateDecision::Ungated;
        };
        let name = gate.name.clone();
        if !gate.requires_approval {
            return GateDecision::Open { gate: name };
        }

        let conditions = &gate.auto_approve_conditions;
        if !conditions.is_empty() && conditions.iter().all(|c| c.is_met(current)) {
            GateDecision::AutoApproved { gate: name }
        } else {
            GateDecision::Pending { gate: name }
        }
    }
}
