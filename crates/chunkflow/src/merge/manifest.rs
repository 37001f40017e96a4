//! The merged artifact: every chunk's output on one job-relative timeline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::chunk_repo::ChunkRow;
use crate::degradation::{profile_for_level, LADDER};
use crate::model::TranscriptSegment;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManifestFrame {
    pub frame_ref: String,
    pub chunk_index: u32,
    /// Seconds from the start of the job.
    pub timestamp_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeManifest {
    pub job_id: String,
    pub generated_at: DateTime<Utc>,
    /// Max end offset across merged chunks.
    pub duration_seconds: f64,
    pub total_chunks: u32,
    pub merged_chunks: Vec<u32>,
    /// Chunks left out of a forced merge.
    pub skipped_chunks: Vec<u32>,
    pub partial: bool,
    /// Highest degradation level among merged chunks.
    pub quality_level: u8,
    pub degraded: bool,
    pub frames: Vec<ManifestFrame>,
    pub transcript: Vec<TranscriptSegment>,
}

/// Sampling rate a chunk's frames were extracted at. `base_rate_hz` applies
/// to full quality; degraded levels scale it by their ladder frame rate.
pub fn chunk_sample_rate(base_rate_hz: f64, quality_level: u8) -> f64 {
    let full = LADDER[0].frame_rate;
    base_rate_hz * profile_for_level(quality_level).frame_rate / full
}

/// Builds the manifest from completed chunks. `chunks` need not be sorted.
pub fn build_manifest(
    job_id: &str,
    mut chunks: Vec<ChunkRow>,
    total_chunks: u32,
    base_rate_hz: f64,
    now: DateTime<Utc>,
) -> MergeManifest {
    chunks.sort_by_key(|c| c.chunk_index);

    let merged: Vec<u32> = chunks.iter().map(|c| c.chunk_index).collect();
    let skipped: Vec<u32> = (0..total_chunks).filter(|i| !merged.contains(i)).collect();
    let quality_level = chunks.iter().map(|c| c.quality_level).max().unwrap_or(0);
    let duration = chunks.iter().map(|c| c.end_seconds).fold(0.0, f64::max);

    let mut frames = Vec::new();
    let mut transcript = Vec::new();
    for chunk in &chunks {
        let rate = chunk_sample_rate(base_rate_hz, chunk.frame_level);
        for (position, frame_ref) in chunk.frame_refs.iter().enumerate() {
            frames.push(ManifestFrame {
                frame_ref: frame_ref.clone(),
                chunk_index: chunk.chunk_index,
                timestamp_seconds: chunk.start_seconds + position as f64 / rate,
            });
        }
        transcript.extend(chunk.transcript.iter().map(|s| TranscriptSegment {
            start: s.start + chunk.start_seconds,
            end: s.end + chunk.start_seconds,
            text: s.text.clone(),
        }));
    }

    if frames
        .windows(2)
        .any(|w| w[1].timestamp_seconds <= w[0].timestamp_seconds)
    {
        log::warn!(
            "Job {} has more frames than its sampling rate allows; timestamps overlap",
            job_id
        );
    }

    MergeManifest {
        job_id: job_id.to_string(),
        generated_at: now,
        duration_seconds: duration,
        total_chunks,
        partial: !skipped.is_empty(),
        merged_chunks: merged,
        skipped_chunks: skipped,
        quality_level,
        degraded: quality_level > 0,
        frames,
        transcript,
    }
}
