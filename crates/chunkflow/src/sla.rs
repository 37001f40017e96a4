//! Expected step durations used for stall detection.

use serde::Serialize;

use crate::config::HealthConfig;
use crate::model::PipelineStep;

/// Expected and maximum durations for one step attempt, in seconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SlaWindow {
    pub expected_seconds: f64,
    /// Past this the unit counts as stalled.
    pub max_seconds: f64,
}

/// Baseline seconds for a unit of the reference length.
pub fn baseline_seconds(step: PipelineStep) -> f64 {
    match step {
        PipelineStep::Probe => 60.0,
        PipelineStep::Transcription => 180.0,
        PipelineStep::FrameExtraction => 120.0,
        PipelineStep::Rendering => 240.0,
        PipelineStep::Merge => 90.0,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SlaTable {
    reference_unit_seconds: f64,
    safety_multiplier: f64,
    stall_factor: f64,
    floor_seconds: f64,
}

impl SlaTable {
    pub fn new(config: &HealthConfig) -> Self {
        Self {
            reference_unit_seconds: config.reference_unit_seconds,
            safety_multiplier: config.sla_safety_multiplier,
            stall_factor: config.stall_factor,
            floor_seconds: config.sla_floor_seconds,
        }
    }

    /// Scales the baseline linearly with unit length. An unknown or
    /// non-positive length uses the baseline as is.
    pub fn window(&self, step: PipelineStep, unit_seconds: Option<f64>) -> SlaWindow {
        let scale = match unit_seconds {
            Some(secs) if secs > 0.0 && self.reference_unit_seconds > 0.0 => {
                secs / self.reference_unit_seconds
            }
            _ => 1.0,
        };
        let expected =
            (baseline_seconds(step) * scale * self.safety_multiplier).max(self.floor_seconds);
        SlaWindow {
            expected_seconds: expected,
            max_seconds: expected * self.stall_factor,
        }
    }
}

impl Default for SlaTable {
    fn default() -> Self {
        Self::new(&HealthConfig::default())
    }
}
