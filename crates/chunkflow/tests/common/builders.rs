//! Builders for test configuration and scripted step executors.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use chunkflow::config::Config;
use chunkflow::model::{PipelineStep, TranscriptSegment};
use chunkflow::{StepExecutor, StepOutput, StepRequest};

/// Builder for creating `Config` instances.
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Defaults with a single worker and the stock gates.
    pub fn new() -> Self {
        let mut config = Config::default();
        config.worker.worker_count = 1;
        Self { config }
    }

    pub fn max_retries(mut self, max_retries: u32) -> Self {
        self.config.worker.max_retries = max_retries;
        self
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.config.worker.worker_count = count;
        self
    }

    pub fn max_parallel_chunks(mut self, max: usize) -> Self {
        self.config.planner.max_parallel_chunks = max;
        self
    }

    pub fn chunk_seconds(mut self, seconds: f64) -> Self {
        self.config.planner.chunk_seconds = seconds;
        self
    }

    pub fn threshold_seconds(mut self, seconds: f64) -> Self {
        self.config.planner.threshold_seconds = seconds;
        self
    }

    pub fn frame_ttl_seconds(mut self, seconds: i64) -> Self {
        self.config.governance.frame_ttl_seconds = seconds;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Makes one step fail while the attempt's degradation level is below
/// `until_level`. `chunk_index: None` matches every unit.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRule {
    pub chunk_index: Option<u32>,
    pub step: PipelineStep,
    pub until_level: u8,
}

/// Produces one transcript segment and a few frames per unit, failing the
/// attempts its rules name.
pub struct ScriptedExecutor {
    rules: Mutex<Vec<FailureRule>>,
    calls: AtomicUsize,
    frames_per_unit: usize,
    dense_frames: bool,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self {
            rules: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
            frames_per_unit: 2,
            dense_frames: false,
        }
    }

    /// Extracts one frame per sampling interval of the unit instead of a
    /// fixed handful.
    pub fn dense_frames(mut self) -> Self {
        self.dense_frames = true;
        self
    }

    pub fn fail(self, chunk_index: Option<u32>, step: PipelineStep, until_level: u8) -> Self {
        self.rules.lock().unwrap().push(FailureRule {
            chunk_index,
            step,
            until_level,
        });
        self
    }

    /// Drops every failure rule; later attempts succeed.
    pub fn heal(&self) {
        self.rules.lock().unwrap().clear();
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    fn should_fail(&self, request: &StepRequest) -> bool {
        let index = request.chunk_id.as_deref().and_then(chunk_index_of);
        self.rules.lock().unwrap().iter().any(|rule| {
            rule.step == request.step
                && request.profile.level < rule.until_level
                && (rule.chunk_index.is_none() || rule.chunk_index == index)
        })
    }
}

impl Default for ScriptedExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl StepExecutor for ScriptedExecutor {
    fn run_step(&self, request: &StepRequest) -> StepOutput {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.should_fail(request) {
            return StepOutput::failed(format!(
                "{} failed at level {}",
                request.step, request.profile.level
            ));
        }
        let owner = request.chunk_id.as_deref().unwrap_or(&request.job_id);
        match request.step {
            PipelineStep::Transcription => StepOutput::ok().with_transcript(vec![TranscriptSegment {
                start: 1.0,
                end: 4.0,
                text: format!("speech in {owner}"),
            }]),
            PipelineStep::FrameExtraction => {
                let count = if self.dense_frames {
                    ((request.end_seconds - request.start_seconds) * request.profile.frame_rate)
                        as usize
                } else {
                    self.frames_per_unit
                };
                StepOutput::ok().with_frames(
                    (0..count)
                        .map(|i| format!("frames/{owner}/{i:04}.jpg"))
                        .collect(),
                )
            }
            _ => StepOutput::ok(),
        }
    }
}

/// `"job-c3"` -> `3`.
fn chunk_index_of(chunk_id: &str) -> Option<u32> {
    chunk_id.rsplit_once("-c")?.1.parse().ok()
}
