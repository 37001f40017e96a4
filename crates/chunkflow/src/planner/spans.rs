//! Pure chunk arithmetic.

use serde::Serialize;

/// A half-open `[start, end)` slice of a job's timeline.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChunkSpan {
    pub index: u32,
    pub start_seconds: f64,
    pub end_seconds: f64,
}

impl ChunkSpan {
    pub fn duration_seconds(&self) -> f64 {
        self.end_seconds - self.start_seconds
    }
}

/// Splits `[0, duration)` into `ceil(duration / chunk_seconds)` contiguous
/// spans. Only the last span may be shorter than `chunk_seconds`.
pub fn compute_spans(duration_seconds: f64, chunk_seconds: f64) -> Vec<ChunkSpan> {
    if duration_seconds <= 0.0 || chunk_seconds <= 0.0 {
        return Vec::new();
    }
    let count = (duration_seconds / chunk_seconds).ceil() as u32;
    (0..count)
        .map(|i| ChunkSpan {
            index: i,
            start_seconds: f64::from(i) * chunk_seconds,
            end_seconds: (f64::from(i + 1) * chunk_seconds).min(duration_seconds),
        })
        .collect()
}

/// Duration implied by payload size at a fixed bytes-per-minute rate.
pub fn estimate_duration_seconds(payload_bytes: u64, bytes_per_minute: u64) -> f64 {
    if bytes_per_minute == 0 {
        return 0.0;
    }
    payload_bytes as f64 / bytes_per_minute as f64 * 60.0
}

pub fn estimate_cost(duration_seconds: f64, cost_per_minute: f64) -> f64 {
    (duration_seconds / 60.0) * cost_per_minute
}
