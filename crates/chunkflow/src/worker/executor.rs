//! Contract for the external unit-of-work executor.

use serde::Serialize;

use crate::degradation::DegradationProfile;
use crate::model::{PipelineStep, TranscriptSegment};

/// Everything an executor needs to run one step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StepRequest {
    pub unit_id: String,
    pub job_id: String,
    /// `None` for a step on an unchunked job.
    pub chunk_id: Option<String>,
    pub step: PipelineStep,
    pub source_ref: Option<String>,
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub profile: DegradationProfile,
}

/// Result of one step. Transcript offsets are relative to `start_seconds`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StepOutput {
    pub success: bool,
    pub frame_refs: Vec<String>,
    pub transcript: Vec<TranscriptSegment>,
    pub error: Option<String>,
}

impl StepOutput {
    pub fn ok() -> Self {
        Self {
            success: true,
            ..Default::default()
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Default::default()
        }
    }

    pub fn with_frames(mut self, frame_refs: Vec<String>) -> Self {
        self.frame_refs = frame_refs;
        self
    }

    pub fn with_transcript(mut self, transcript: Vec<TranscriptSegment>) -> Self {
        self.transcript = transcript;
        self
    }
}

/// Performs transcription, frame extraction, and rendering. The runner only
/// reads the returned output.
pub trait StepExecutor: Send + Sync {
    fn run_step(&self, request: &StepRequest) -> StepOutput;
}

impl<F> StepExecutor for F
where
    F: Fn(&StepRequest) -> StepOutput + Send + Sync,
{
    fn run_step(&self, request: &StepRequest) -> StepOutput {
        self(request)
    }
}
