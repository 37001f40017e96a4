//! Output verification: does a job hold the data its status claims?

use serde::Serialize;

use crate::db::job_repo::JobRow;
use crate::degradation::profile_for_level;
use crate::model::{JobStatus, PipelineStep};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputVerification {
    pub job_id: String,
    pub status: JobStatus,
    pub transcript_segments: usize,
    pub frame_refs: usize,
    pub quality_level: u8,
    /// Steps whose outputs the status implies but which are absent.
    pub missing_steps: Vec<PipelineStep>,
}

impl OutputVerification {
    pub fn is_complete(&self) -> bool {
        self.missing_steps.is_empty()
    }
}

/// Only a completed job implies outputs. Frames are not expected when the
/// job finished in a transcript-only mode.
pub fn verify_job(job: &JobRow) -> OutputVerification {
    let mut missing_steps = Vec::new();
    if job.status == JobStatus::Completed {
        if job.transcript.is_empty() {
            missing_steps.push(PipelineStep::Transcription);
        }
        if job.frame_refs.is_empty() && !profile_for_level(job.quality_level).transcript_only {
            missing_steps.push(PipelineStep::FrameExtraction);
        }
    }
    OutputVerification {
        job_id: job.id.clone(),
        status: job.status,
        transcript_segments: job.transcript.len(),
        frame_refs: job.frame_refs.len(),
        quality_level: job.quality_level,
        missing_steps,
    }
}
