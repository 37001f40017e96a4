//! End-to-end runs of jobs through planning, the step chain, retries down
//! the degradation ladder, merge, health checks and recovery.

mod common;

use chrono::{Duration, Utc};

use chunkflow::db::{job_repo, work_unit_repo};
use chunkflow::health::{IssueKind, RecoveryOutcome};
use chunkflow::degradation::MAX_LEVEL;
use chunkflow::merge::{build_manifest, MergeManifest};
use chunkflow::model::{ApprovalStatus, ChunkStatus, Decision, JobStatus, PipelineStep};
use chunkflow::{AdvanceOutcome, MergeOptions, MergeOutcome, PipelineEvent, PlanHints};

use common::{ConfigBuilder, ScriptedExecutor, TestHarness};

#[test]
fn test_long_job_runs_to_merged_artifact() {
    let harness = TestHarness::new();
    harness.submit("lecture", 5400.0);

    let job = harness.orchestrator.process_job("lecture").unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.chunk_count, 9);
    assert_eq!(job.completed_chunks, 9);
    assert_eq!(job.quality_level, 0);
    assert_eq!(job.transcript.len(), 9);
    assert_eq!(job.transcript[1].start, 601.0);
    assert_eq!(job.frame_refs.len(), 18);
    assert!(harness
        .artifact_dir
        .join("jobs/lecture/manifest.json")
        .exists());
    assert!(harness
        .orchestrator
        .chunks("lecture")
        .unwrap()
        .iter()
        .all(|c| c.status == ChunkStatus::Merged));
    assert!(harness.orchestrator.verify_outputs("lecture").unwrap().is_complete());
    // transcription, frame extraction and rendering per chunk
    assert_eq!(harness.executor.calls(), 27);
}

#[test]
fn test_short_job_runs_whole() {
    let harness = TestHarness::new();
    harness.submit("clip", 240.0);

    let job = harness.orchestrator.process_job("clip").unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert!(!job.chunked);
    assert!(job.artifact_ref.is_none());
    assert_eq!(job.transcript.len(), 1);
    assert_eq!(job.frame_refs.len(), 2);
    assert!(harness.orchestrator.chunks("clip").unwrap().is_empty());
}

#[test]
fn test_failing_chunk_degrades_instead_of_failing() {
    let executor = ScriptedExecutor::new().fail(Some(1), PipelineStep::FrameExtraction, 3);
    let harness = TestHarness::with(ConfigBuilder::new().build(), executor);
    harness.submit("flaky", 1800.0);

    let job = harness.orchestrator.process_job("flaky").unwrap();

    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.quality_level, 3);
    assert_eq!(job.failed_chunks, 0);
    let chunks = harness.orchestrator.chunks("flaky").unwrap();
    assert_eq!(chunks[0].quality_level, 0);
    assert_eq!(chunks[1].quality_level, 3);
    assert!(harness.orchestrator.pending_frames().unwrap().is_empty());

    let events = harness.orchestrator.events().drain(1000).unwrap();
    let merged = events.iter().find_map(|e| match &e.event {
        PipelineEvent::JobMerged {
            degraded,
            quality_level,
            ..
        } => Some((*degraded, *quality_level)),
        _ => None,
    });
    assert_eq!(merged, Some((true, 3)));
    let retries = events
        .iter()
        .filter(|e| matches!(e.event, PipelineEvent::StepFailed { will_retry: true, .. }))
        .count();
    assert_eq!(retries, 3);
}

#[test]
fn test_exhausted_chunk_needs_force_to_merge() {
    let executor = ScriptedExecutor::new().fail(Some(1), PipelineStep::Transcription, u8::MAX);
    let harness = TestHarness::with(ConfigBuilder::new().max_retries(1).build(), executor);
    harness.submit("partial", 1800.0);

    let job = harness.orchestrator.process_job("partial").unwrap();
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.completed_chunks, 2);

    let pending = harness.orchestrator.pending_frames().unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].operation, "mark_failed");
    assert_eq!(pending[0].target.id, "partial-c1");
    harness
        .orchestrator
        .approve_frame(&pending[0].id, "lead@example.com", Decision::Approved, None)
        .unwrap();
    assert_eq!(harness.job("partial").failed_chunks, 1);

    let err = harness
        .orchestrator
        .merge("partial", MergeOptions::default())
        .unwrap_err();
    assert!(err.is_conflict());

    let outcome = harness
        .orchestrator
        .merge("partial", MergeOptions { force: true })
        .unwrap();
    let MergeOutcome::Merged(summary) = outcome else {
        panic!("expected a forced merge, got {outcome:?}");
    };
    assert!(summary.partial);
    assert_eq!(summary.merged_chunks, 2);
    assert_eq!(summary.skipped_chunks, vec![1]);

    let job = harness.job("partial");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.transcript.len(), 2);

    let again = harness
        .orchestrator
        .merge("partial", MergeOptions { force: true })
        .unwrap();
    assert!(matches!(again, MergeOutcome::AlreadyMerged { .. }));
}

#[test]
fn test_recovery_resumes_a_failed_chunk() {
    let executor = ScriptedExecutor::new().fail(Some(2), PipelineStep::Transcription, u8::MAX);
    let harness = TestHarness::with(ConfigBuilder::new().max_retries(1).build(), executor);
    harness.submit("resume", 1800.0);
    harness.orchestrator.process_job("resume").unwrap();
    let pending = harness.orchestrator.pending_frames().unwrap();
    harness
        .orchestrator
        .approve_frame(&pending[0].id, "lead@example.com", Decision::Approved, None)
        .unwrap();

    harness.executor.heal();
    let report = harness.orchestrator.recover("resume").unwrap();
    assert_eq!(report.outcome, RecoveryOutcome::Requeued);
    assert_eq!(report.plan.failed_chunks, vec!["resume-c2".to_string()]);
    assert_eq!(report.requeued.len(), 1);
    assert_eq!(report.requeued[0].step, PipelineStep::Transcription);
    let job = harness.job("resume");
    assert_eq!(job.status, JobStatus::Processing);
    assert_eq!(job.failed_chunks, 0);

    let outcomes = harness.orchestrator.run_units(report.requeued).unwrap();
    assert!(outcomes
        .iter()
        .any(|o| matches!(o, AdvanceOutcome::Merged { outcome: MergeOutcome::Merged(_), .. })));
    let job = harness.job("resume");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.completed_chunks, 3);
    assert_eq!(job.transcript.len(), 3);
}

#[test]
fn test_completed_job_missing_outputs_is_detected_and_recovered() {
    let harness = TestHarness::new();
    harness.submit("hollow", 120.0);
    harness
        .db
        .with_conn(|c| job_repo::set_status(c, "hollow", JobStatus::Completed, None, Utc::now()))
        .unwrap();

    let report = harness.orchestrator.check_health().unwrap();
    let missing: Vec<_> = report.issues_of(IssueKind::MissingOutputs).collect();
    assert_eq!(missing.len(), 1);
    assert_eq!(missing[0].job_id, "hollow");
    let verification = harness.orchestrator.verify_outputs("hollow").unwrap();
    assert_eq!(
        verification.missing_steps,
        vec![PipelineStep::Transcription, PipelineStep::FrameExtraction]
    );

    let recovery = harness.orchestrator.recover("hollow").unwrap();
    assert_eq!(recovery.outcome, RecoveryOutcome::Requeued);
    assert_eq!(recovery.requeued.len(), 2);
    let frame = harness
        .orchestrator
        .governor()
        .find_frame(recovery.frame_id.as_deref().unwrap())
        .unwrap();
    assert_eq!(frame.approval_status, ApprovalStatus::Approved);
    assert_eq!(frame.approved_by.as_deref(), Some("auto:output_recovery"));

    harness.orchestrator.run_units(recovery.requeued).unwrap();
    assert!(harness.orchestrator.verify_outputs("hollow").unwrap().is_complete());
    assert_eq!(harness.job("hollow").status, JobStatus::Completed);
    assert!(harness.orchestrator.check_health().unwrap().issues.is_empty());
}

#[test]
fn test_stalled_unit_is_reported_and_retried() {
    let harness = TestHarness::new();
    harness.submit("stuck", 1800.0);
    harness
        .orchestrator
        .plan_chunks("stuck", &PlanHints::default())
        .unwrap();
    let units = harness.orchestrator.start_job("stuck").unwrap();
    let started = Utc::now();
    harness
        .db
        .with_conn(|c| {
            work_unit_repo::claim(c, &units[0].id, started)?;
            job_repo::touch_heartbeat(c, "stuck", "transcription", started)
        })
        .unwrap();

    let later = started + Duration::hours(2);
    let monitor = harness.orchestrator.monitor();
    let report = monitor.check_health_at(later).unwrap();
    assert!(!report.healthy);
    assert_eq!(report.stalled_units, 1);
    assert_eq!(report.stale_heartbeats, 1);
    let stalled: Vec<_> = report.issues_of(IssueKind::StalledUnit).collect();
    assert_eq!(stalled[0].threshold_seconds, Some(540.0));

    let recovery = monitor.recover_at("stuck", later).unwrap();
    assert_eq!(recovery.outcome, RecoveryOutcome::Requeued);
    assert_eq!(recovery.requeued.len(), 1);
    assert_eq!(recovery.requeued[0].retry_count, 1);
    assert_eq!(recovery.requeued[0].chunk_id, units[0].chunk_id);

    let mut remaining = recovery.requeued;
    remaining.extend(units.into_iter().skip(1));
    harness.orchestrator.run_units(remaining).unwrap();
    let job = harness.job("stuck");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.quality_level, 1);
}

#[test]
fn test_worker_pool_processes_a_job() {
    let config = ConfigBuilder::new()
        .worker_count(4)
        .max_parallel_chunks(2)
        .build();
    let harness = TestHarness::with(config, ScriptedExecutor::new());
    harness.submit("pooled", 3600.0);
    harness
        .orchestrator
        .plan_chunks("pooled", &PlanHints::default())
        .unwrap();
    let units = harness.orchestrator.start_job("pooled").unwrap();
    assert_eq!(units.len(), 6);

    let pool = harness.orchestrator.worker_pool();
    let results = pool.run_to_completion(units).unwrap();
    pool.shutdown();
    pool.wait();

    assert!(results.iter().all(|r| r.outcome.is_ok()));
    assert_eq!(results.len(), 6 * 3 + 1);
    let job = harness.job("pooled");
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.completed_chunks, 6);
}

#[test]
fn test_outbox_records_the_whole_run() {
    let harness = TestHarness::new();
    harness.submit("audited", 1800.0);
    let mut live = harness.orchestrator.events().subscribe();

    harness.orchestrator.process_job("audited").unwrap();

    let events = harness.orchestrator.events().drain(1000).unwrap();
    let kinds: Vec<&str> = events.iter().map(|e| e.event.kind()).collect();
    assert_eq!(kinds.first(), Some(&"ChunksPlanned"));
    assert_eq!(kinds.last(), Some(&"StepCompleted"));
    assert_eq!(kinds.iter().filter(|k| **k == "JobMerged").count(), 1);
    assert!(live.try_recv().is_ok());

    let ids: Vec<i64> = events.iter().map(|e| e.id).collect();
    assert_eq!(harness.orchestrator.events().ack(&ids).unwrap(), ids.len());
    assert!(harness.orchestrator.events().drain(1000).unwrap().is_empty());
}

#[test]
fn test_manifest_places_chunks_on_job_timeline() {
    let harness = TestHarness::new();
    harness.submit("timeline", 1800.0);
    harness.orchestrator.process_job("timeline").unwrap();
    let chunks = harness.orchestrator.chunks("timeline").unwrap();

    let manifest = build_manifest("timeline", chunks, 3, 1.0, Utc::now());
    assert_eq!(manifest.duration_seconds, 1800.0);
    assert_eq!(manifest.frames[2].chunk_index, 1);
    assert_eq!(manifest.frames[2].timestamp_seconds, 600.0);
    assert_eq!(manifest.frames[3].timestamp_seconds, 601.0);
    assert!(!manifest.partial);
}

fn assert_strictly_increasing(manifest: &MergeManifest) {
    let overlap = manifest
        .frames
        .windows(2)
        .find(|w| w[1].timestamp_seconds <= w[0].timestamp_seconds);
    assert!(overlap.is_none(), "frame timestamps overlap: {overlap:?}");
}

#[test]
fn test_render_retry_keeps_extraction_timeline() {
    let executor = ScriptedExecutor::new()
        .dense_frames()
        .fail(Some(0), PipelineStep::Rendering, 1);
    let harness = TestHarness::with(ConfigBuilder::new().build(), executor);
    harness.submit("rerender", 1800.0);

    let job = harness.orchestrator.process_job("rerender").unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.quality_level, 1);
    let chunks = harness.orchestrator.chunks("rerender").unwrap();
    assert_eq!(chunks[0].quality_level, 1);
    assert_eq!(chunks[0].frame_level, 0);

    let manifest = harness.manifest("rerender");
    assert_eq!(manifest.frames.len(), 1800);
    assert_eq!(manifest.frames[599].timestamp_seconds, 599.0);
    assert_eq!(manifest.frames[600].timestamp_seconds, 600.0);
    assert_strictly_increasing(&manifest);
}

#[test]
fn test_salvaged_chunk_keeps_extraction_timeline() {
    let executor = ScriptedExecutor::new()
        .dense_frames()
        .fail(Some(0), PipelineStep::Rendering, u8::MAX);
    let harness = TestHarness::with(ConfigBuilder::new().max_retries(1).build(), executor);
    harness.submit("salvaged", 1800.0);

    let job = harness.orchestrator.process_job("salvaged").unwrap();
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.quality_level, MAX_LEVEL);
    let chunks = harness.orchestrator.chunks("salvaged").unwrap();
    assert_eq!(chunks[0].quality_level, MAX_LEVEL);
    assert_eq!(chunks[0].frame_level, 0);

    let manifest = harness.manifest("salvaged");
    assert!(manifest.degraded);
    assert_eq!(manifest.frames[600].chunk_index, 1);
    assert_eq!(manifest.frames[600].timestamp_seconds, 600.0);
    assert_strictly_increasing(&manifest);
}
