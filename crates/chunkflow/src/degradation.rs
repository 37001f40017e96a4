//! Degradation ladder: progressively cheaper processing profiles selected by
//! retry count.

use serde::Serialize;

/// Output resolution tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    P360,
    P480,
    P720,
    P1080,
}

impl Resolution {
    pub fn height(&self) -> u32 {
        match self {
            Resolution::P360 => 360,
            Resolution::P480 => 480,
            Resolution::P720 => 720,
            Resolution::P1080 => 1080,
        }
    }
}

/// One rung of the ladder. Immutable static configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct DegradationProfile {
    pub level: u8,
    pub name: &'static str,
    /// Frames sampled per second of video.
    pub frame_rate: f64,
    pub resolution: Resolution,
    pub chunk_seconds: f64,
    pub skip_rendering: bool,
    pub transcript_first: bool,
    /// No frame extraction at all.
    pub transcript_only: bool,
}

impl DegradationProfile {
    pub fn is_degraded(&self) -> bool {
        self.level > 0
    }
}

/// Most to least expensive.
pub static LADDER: [DegradationProfile; 6] = [
    DegradationProfile {
        level: 0,
        name: "full",
        frame_rate: 1.0,
        resolution: Resolution::P1080,
        chunk_seconds: 600.0,
        skip_rendering: false,
        transcript_first: false,
        transcript_only: false,
    },
    DegradationProfile {
        level: 1,
        name: "reduced_fps",
        frame_rate: 0.5,
        resolution: Resolution::P1080,
        chunk_seconds: 600.0,
        skip_rendering: false,
        transcript_first: false,
        transcript_only: false,
    },
    DegradationProfile {
        level: 2,
        name: "reduced_resolution",
        frame_rate: 0.5,
        resolution: Resolution::P720,
        chunk_seconds: 300.0,
        skip_rendering: false,
        transcript_first: false,
        transcript_only: false,
    },
    DegradationProfile {
        level: 3,
        name: "minimal_frames",
        frame_rate: 0.2,
        resolution: Resolution::P480,
        chunk_seconds: 300.0,
        skip_rendering: true,
        transcript_first: false,
        transcript_only: false,
    },
    DegradationProfile {
        level: 4,
        name: "transcript_first",
        frame_rate: 0.1,
        resolution: Resolution::P480,
        chunk_seconds: 180.0,
        skip_rendering: true,
        transcript_first: true,
        transcript_only: false,
    },
    DegradationProfile {
        level: 5,
        name: "safe_mode",
        frame_rate: 0.02,
        resolution: Resolution::P360,
        chunk_seconds: 120.0,
        skip_rendering: true,
        transcript_first: true,
        transcript_only: true,
    },
];

pub const MAX_LEVEL: u8 = 5;

/// The profile for an attempt with `retry_count` prior failures. Clamps at
/// the last rung.
pub fn mode_for_retry(retry_count: u32) -> &'static DegradationProfile {
    let idx = (retry_count as usize).min(LADDER.len() - 1);
    &LADDER[idx]
}

/// Looks up a profile by its level, clamping out-of-range values.
pub fn profile_for_level(level: u8) -> &'static DegradationProfile {
    mode_for_retry(u32::from(level))
}
