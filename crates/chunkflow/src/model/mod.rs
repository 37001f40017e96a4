//! Typed domain vocabulary shared by the repositories and the governance
//! layer.

pub mod entity;
pub mod gate;
pub mod status;

pub use entity::{EntityRef, EntityType};
pub use gate::{ApprovalGate, AutoApproveCondition};
pub use status::{
    ApprovalStatus, ChunkStatus, ConstraintStatus, Decision, FrameType, JobStatus, ParseEnumError,
    PipelineStep, Severity, WorkUnitStatus,
};

use serde::{Deserialize, Serialize};

/// One transcript segment. Offsets are seconds relative to the unit that
/// produced it (chunk-relative for chunk output, job-relative after merge).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}
