//! Table-driven tests for chunk planning, the degradation ladder and SLA
//! windows.

mod common;

use chunkflow::degradation::{mode_for_retry, Resolution, MAX_LEVEL};
use chunkflow::model::{ChunkStatus, JobStatus, PipelineStep};
use chunkflow::planner::{compute_spans, PlanHints};
use chunkflow::{NewJob, SlaTable};

use common::TestHarness;

/// Represents a single planning test case.
struct PlanTestCase {
    /// Test case name for identification.
    name: &'static str,
    duration_seconds: f64,
    force: bool,
    expected_chunked: bool,
    expected_chunks: u32,
    /// Length of the final chunk, when chunked.
    expected_last_seconds: Option<f64>,
}

const PLAN_TESTS: &[PlanTestCase] = &[
    PlanTestCase {
        name: "ninety_minutes_nine_chunks",
        duration_seconds: 5400.0,
        force: false,
        expected_chunked: true,
        expected_chunks: 9,
        expected_last_seconds: Some(600.0),
    },
    PlanTestCase {
        name: "exactly_at_threshold",
        duration_seconds: 1800.0,
        force: false,
        expected_chunked: true,
        expected_chunks: 3,
        expected_last_seconds: Some(600.0),
    },
    PlanTestCase {
        name: "just_below_threshold",
        duration_seconds: 1799.0,
        force: false,
        expected_chunked: false,
        expected_chunks: 0,
        expected_last_seconds: None,
    },
    PlanTestCase {
        name: "short_remainder_chunk",
        duration_seconds: 2450.0,
        force: false,
        expected_chunked: true,
        expected_chunks: 5,
        expected_last_seconds: Some(50.0),
    },
    PlanTestCase {
        name: "forced_short_job",
        duration_seconds: 900.0,
        force: true,
        expected_chunked: true,
        expected_chunks: 2,
        expected_last_seconds: Some(300.0),
    },
];

#[test]
fn test_chunk_plans() {
    let harness = TestHarness::new();
    for test_case in PLAN_TESTS {
        harness.submit(test_case.name, test_case.duration_seconds);
        let hints = PlanHints {
            force: test_case.force,
            ..Default::default()
        };
        let plan = harness
            .orchestrator
            .plan_chunks(test_case.name, &hints)
            .unwrap_or_else(|e| panic!("Test '{}': planning failed: {}", test_case.name, e));

        assert_eq!(
            plan.chunked, test_case.expected_chunked,
            "Test '{}': chunked",
            test_case.name
        );
        assert_eq!(
            plan.chunk_count, test_case.expected_chunks,
            "Test '{}': chunk count",
            test_case.name
        );

        let chunks = harness.orchestrator.chunks(test_case.name).unwrap();
        assert_eq!(chunks.len() as u32, test_case.expected_chunks, "Test '{}'", test_case.name);
        if let Some(last) = test_case.expected_last_seconds {
            let final_chunk = chunks.last().unwrap();
            assert!(
                (final_chunk.duration_seconds() - last).abs() < 1e-9,
                "Test '{}': last chunk spans {}s",
                test_case.name,
                final_chunk.duration_seconds()
            );
            assert_eq!(final_chunk.end_seconds, test_case.duration_seconds);
        }
        assert!(chunks.iter().all(|c| c.status == ChunkStatus::Pending));

        let job = harness.job(test_case.name);
        assert_eq!(job.chunked, test_case.expected_chunked);
        assert!(job.cost_estimate.is_some());
    }
}

#[test]
fn test_planning_twice_returns_the_same_chunks() {
    let harness = TestHarness::new();
    harness.submit("repeat", 5400.0);

    let first = harness
        .orchestrator
        .plan_chunks("repeat", &PlanHints::default())
        .unwrap();
    let second = harness
        .orchestrator
        .plan_chunks("repeat", &PlanHints::default())
        .unwrap();

    assert!(!first.reused);
    assert!(second.reused);
    assert_eq!(first.chunk_count, second.chunk_count);
    let ids = |plan: &chunkflow::ChunkPlan| plan.chunks.iter().map(|c| c.id.clone()).collect::<Vec<_>>();
    assert_eq!(ids(&first), ids(&second));
    assert_eq!(harness.orchestrator.chunks("repeat").unwrap().len(), 9);
}

#[test]
fn test_dry_run_writes_nothing() {
    let harness = TestHarness::new();
    harness.submit("preview", 3600.0);

    let plan = harness
        .orchestrator
        .plan_chunks(
            "preview",
            &PlanHints {
                dry_run: true,
                ..Default::default()
            },
        )
        .unwrap();

    assert_eq!(plan.chunk_count, 6);
    assert!(plan.chunks.is_empty());
    assert!(harness.orchestrator.chunks("preview").unwrap().is_empty());
    let job = harness.job("preview");
    assert!(job.cost_estimate.is_none());
    assert_eq!(job.status, JobStatus::Queued);
}

#[test]
fn test_unknown_duration_is_estimated_from_payload() {
    let harness = TestHarness::new();
    harness
        .orchestrator
        .submit_job(NewJob {
            id: Some("sized".to_string()),
            source_ref: Some("s3://media/sized.mp4".to_string()),
            payload_bytes: Some(40 * 10 * 1024 * 1024),
            duration_seconds: 0.0,
        })
        .unwrap();

    let plan = harness
        .orchestrator
        .plan_chunks("sized", &PlanHints::default())
        .unwrap();

    assert!(plan.duration_estimated);
    assert_eq!(plan.duration_seconds, 2400.0);
    assert_eq!(plan.chunk_count, 4);
}

#[test]
fn test_planning_unknown_job_is_not_found() {
    let harness = TestHarness::new();
    let err = harness
        .orchestrator
        .plan_chunks("missing", &PlanHints::default())
        .unwrap_err();
    assert!(matches!(err, chunkflow::ChunkflowError::NotFound { .. }));
}

#[test]
fn test_spans_tile_the_duration() {
    let spans = compute_spans(5400.0, 600.0);
    assert_eq!(spans.len(), 9);
    for (i, span) in spans.iter().enumerate() {
        assert_eq!(span.index as usize, i);
        assert_eq!(span.start_seconds, i as f64 * 600.0);
    }
}

/// Represents a single degradation ladder lookup.
struct LadderTestCase {
    retry_count: u32,
    expected_level: u8,
    expected_resolution: Resolution,
    expected_skip_rendering: bool,
    expected_transcript_only: bool,
}

const LADDER_TESTS: &[LadderTestCase] = &[
    LadderTestCase {
        retry_count: 0,
        expected_level: 0,
        expected_resolution: Resolution::P1080,
        expected_skip_rendering: false,
        expected_transcript_only: false,
    },
    LadderTestCase {
        retry_count: 2,
        expected_level: 2,
        expected_resolution: Resolution::P720,
        expected_skip_rendering: false,
        expected_transcript_only: false,
    },
    LadderTestCase {
        retry_count: 3,
        expected_level: 3,
        expected_resolution: Resolution::P480,
        expected_skip_rendering: true,
        expected_transcript_only: false,
    },
    LadderTestCase {
        retry_count: 5,
        expected_level: 5,
        expected_resolution: Resolution::P360,
        expected_skip_rendering: true,
        expected_transcript_only: true,
    },
    LadderTestCase {
        retry_count: 7,
        expected_level: 5,
        expected_resolution: Resolution::P360,
        expected_skip_rendering: true,
        expected_transcript_only: true,
    },
];

#[test]
fn test_degradation_ladder() {
    for test_case in LADDER_TESTS {
        let profile = mode_for_retry(test_case.retry_count);
        assert_eq!(
            profile.level, test_case.expected_level,
            "retry {}: level",
            test_case.retry_count
        );
        assert_eq!(profile.resolution, test_case.expected_resolution);
        assert_eq!(profile.skip_rendering, test_case.expected_skip_rendering);
        assert_eq!(profile.transcript_only, test_case.expected_transcript_only);
    }
    assert_eq!(mode_for_retry(u32::MAX).level, MAX_LEVEL);
}

#[test]
fn test_ladder_only_ever_degrades() {
    for retry in 0..8 {
        let this = mode_for_retry(retry);
        let next = mode_for_retry(retry + 1);
        assert!(next.frame_rate <= this.frame_rate);
        assert!(next.resolution.height() <= this.resolution.height());
        assert!(next.chunk_seconds <= this.chunk_seconds);
    }
}

#[test]
fn test_sla_windows_scale_with_unit_length() {
    let sla = SlaTable::default();

    let reference = sla.window(PipelineStep::Transcription, Some(600.0));
    assert_eq!(reference.expected_seconds, 270.0);
    assert_eq!(reference.max_seconds, 540.0);

    let half = sla.window(PipelineStep::Transcription, Some(300.0));
    assert_eq!(half.expected_seconds, 135.0);

    let tiny = sla.window(PipelineStep::Probe, Some(10.0));
    assert_eq!(tiny.expected_seconds, 60.0);

    let unknown = sla.window(PipelineStep::Rendering, None);
    assert_eq!(unknown.expected_seconds, 360.0);
}
