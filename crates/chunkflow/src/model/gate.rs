//! Approval gate configuration records.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::entity::EntityType;

/// A static rule mapping operations on entity types to an approval
/// requirement. Gates are matched, never mutated by the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApprovalGate {
    pub name: String,
    /// `|`-separated substrings; the gate matches when any of them occurs in
    /// the operation name.
    pub operation_pattern: String,
    pub entity_types: Vec<EntityType>,
    #[serde(default = "default_true")]
    pub requires_approval: bool,
    #[serde(default)]
    pub auto_approve_conditions: Vec<AutoApproveCondition>,
    #[serde(default = "default_true")]
    pub active: bool,
}

fn default_true() -> bool {
    true
}

impl ApprovalGate {
    /// The non-empty alternatives of the operation pattern.
    pub fn pattern_alternatives(&self) -> impl Iterator<Item = &str> {
        self.operation_pattern
            .split('|')
            .map(str::trim)
            .filter(|p| !p.is_empty())
    }

    pub fn matches(&self, operation: &str, entity_type: EntityType) -> bool {
        self.active
            && self.entity_types.contains(&entity_type)
            && self.pattern_alternatives().any(|p| operation.contains(p))
    }
}

/// A condition under which a gated operation may skip human approval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AutoApproveCondition {
    /// Every named field of the entity's current state must be meaningfully
    /// present.
    DataCheck { fields: Vec<String> },
}

impl AutoApproveCondition {
    /// Evaluates against the current entity state. A missing entity never
    /// satisfies a condition.
    pub fn is_met(&self, current: Option<&Value>) -> bool {
        let Some(current) = current else {
            return false;
        };
        match self {
            AutoApproveCondition::DataCheck { fields } => fields
                .iter()
                .all(|field| current.get(field).is_some_and(is_meaningfully_present)),
        }
    }
}

/// Non-empty array, non-empty object, or a non-null, non-blank scalar.
pub fn is_meaningfully_present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::String(s) => !s.trim().is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
        Value::Bool(_) | Value::Number(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn gate(pattern: &str) -> ApprovalGate {
        ApprovalGate {
            name: "g".to_string(),
            operation_pattern: pattern.to_string(),
            entity_types: vec![EntityType::Job],
            requires_approval: true,
            auto_approve_conditions: vec![],
            active: true,
        }
    }

    #[test]
    fn test_or_pattern_matches_any_alternative() {
        let g = gate("mark_failed | reject");
        assert!(g.matches("mark_failed", EntityType::Job));
        assert!(g.matches("reject_job", EntityType::Job));
        assert!(!g.matches("merge_chunks", EntityType::Job));
        assert!(!g.matches("mark_failed", EntityType::Chunk));
    }

    #[test]
    fn test_inactive_gate_never_matches() {
        let mut g = gate("merge");
        g.active = false;
        assert!(!g.matches("merge_chunks", EntityType::Job));
    }

    #[test]
    fn test_empty_alternatives_are_ignored() {
        let g = gate("||merge|");
        assert_eq!(g.pattern_alternatives().collect::<Vec<_>>(), vec!["merge"]);
    }

    #[test]
    fn test_meaningful_presence() {
        assert!(!is_meaningfully_present(&json!(null)));
        assert!(!is_meaningfully_present(&json!("  ")));
        assert!(!is_meaningfully_present(&json!([])));
        assert!(!is_meaningfully_present(&json!({})));
        assert!(is_meaningfully_present(&json!("s3://bucket/video.mp4")));
        assert!(is_meaningfully_present(&json!([1])));
        assert!(is_meaningfully_present(&json!({"a": 1})));
        assert!(is_meaningfully_present(&json!(0)));
    }

    #[test]
    fn test_data_check_reads_current_state() {
        let cond = AutoApproveCondition::DataCheck {
            fields: vec!["frame_refs".to_string(), "source_ref".to_string()],
        };
        assert!(cond.is_met(Some(&json!({"frame_refs": ["f"], "source_ref": "s"}))));
        assert!(!cond.is_met(Some(&json!({"frame_refs": [], "source_ref": "s"}))));
        assert!(!cond.is_met(Some(&json!({"source_ref": "s"}))));
        assert!(!cond.is_met(None));
    }

    #[test]
    fn test_condition_deserializes_from_tagged_json() {
        let cond: AutoApproveCondition =
            serde_json::from_value(json!({"type": "data_check", "fields": ["x"]})).unwrap();
        assert_eq!(
            cond,
            AutoApproveCondition::DataCheck {
                fields: vec!["x".to_string()]
            }
        );
    }
}
