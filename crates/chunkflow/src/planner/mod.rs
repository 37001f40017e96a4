//! Chunk planner: decides whether a job is split and materializes its
//! chunk rows.

pub mod spans;

pub use spans::{compute_spans, estimate_cost, estimate_duration_seconds, ChunkSpan};

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::config::PlannerConfig;
use crate::db::chunk_repo::{self, ChunkRow};
use crate::db::job_repo::{self, JobRow, PlanUpdate};
use crate::db::Database;
use crate::error::{ChunkflowError, Result};
use crate::events::{EventBus, PipelineEvent};
use crate::model::ChunkStatus;

/// Caller-supplied planning inputs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanHints {
    /// Chunk even below the threshold.
    pub force: bool,
    /// Compute the plan and cost without writing anything.
    pub dry_run: bool,
    /// Known duration, overriding the stored one.
    pub duration_seconds: Option<f64>,
    /// Payload size used to estimate an unknown duration.
    pub payload_bytes: Option<u64>,
    /// Chunk length override, e.g. from a degraded profile.
    pub chunk_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChunkPlan {
    pub job_id: String,
    pub chunked: bool,
    pub duration_seconds: f64,
    pub duration_estimated: bool,
    pub chunk_count: u32,
    pub cost_estimate: f64,
    /// Chunks allowed to run at once for this job.
    pub max_parallel_chunks: usize,
    pub spans: Vec<ChunkSpan>,
    /// Persisted chunk rows; empty for dry runs and unchunked jobs.
    pub chunks: Vec<ChunkRow>,
    /// True when an earlier plan was found and returned unchanged.
    pub reused: bool,
    pub dry_run: bool,
}

#[derive(Clone)]
pub struct ChunkPlanner {
    db: Database,
    config: PlannerConfig,
    events: EventBus,
}

impl ChunkPlanner {
    pub fn new(db: Database, config: PlannerConfig, events: EventBus) -> Self {
        Self { db, config, events }
    }

    pub fn plan_chunks(&self, job_id: &str, hints: &PlanHints) -> Result<ChunkPlan> {
        self.plan_chunks_at(job_id, hints, Utc::now())
    }

    pub fn plan_chunks_at(
        &self,
        job_id: &str,
        hints: &PlanHints,
        now: DateTime<Utc>,
    ) -> Result<ChunkPlan> {
        let span = tracing::info_span!("plan_chunks", job_id = %job_id, dry_run = hints.dry_run);
        let _guard = span.enter();

        let job = self
            .db
            .with_conn(|c| job_repo::find_by_id(c, job_id))?
            .ok_or_else(|| ChunkflowError::not_found(format!("job {job_id}")))?;

        let (duration, estimated) = self.resolve_duration(&job, hints)?;
        let chunk_seconds = hints.chunk_seconds.unwrap_or(self.config.chunk_seconds);
        if chunk_seconds.is_nan() || chunk_seconds <= 0.0 {
            return Err(ChunkflowError::Validation(format!(
                "chunk length must be positive, got {chunk_seconds}"
            )));
        }

        let chunked = hints.force || duration >= self.config.threshold_seconds;
        let spans = if chunked {
            compute_spans(duration, chunk_seconds)
        } else {
            Vec::new()
        };
        let cost = estimate_cost(duration, self.config.cost_per_minute);
        let mut plan = ChunkPlan {
            job_id: job_id.to_string(),
            chunked,
            duration_seconds: duration,
            duration_estimated: estimated,
            chunk_count: spans.len() as u32,
            cost_estimate: cost,
            max_parallel_chunks: self.config.max_parallel_chunks.min(spans.len().max(1)),
            spans,
            chunks: Vec::new(),
            reused: false,
            dry_run: hints.dry_run,
        };

        if hints.dry_run {
            log::info!(
                "Dry-run plan for job {}: {} chunks, cost estimate {:.2}",
                job_id,
                plan.chunk_count,
                plan.cost_estimate
            );
            return Ok(plan);
        }

        let (plan, event) = self.db.with_tx(|conn| -> Result<(ChunkPlan, Option<PipelineEvent>)> {
            let chunk_rows: Vec<ChunkRow> = plan
                .spans
                .iter()
                .map(|s| new_chunk(job_id, s, plan.chunk_count, now))
                .collect();

            for row in &chunk_rows {
                if let Err(e) = chunk_repo::insert(conn, row) {
                    if !e.is_unique_violation() {
                        return Err(e.into());
                    }
                    log::info!("Job {} already planned, returning existing chunks", job_id);
                    let existing = chunk_repo::list_by_job(conn, job_id)?;
                    return Ok((reused_plan(plan.clone(), existing), None));
                }
            }

            if !plan.chunked {
                let existing = chunk_repo::list_by_job(conn, job_id)?;
                if !existing.is_empty() {
                    return Ok((reused_plan(plan.clone(), existing), None));
                }
            }

            job_repo::record_plan(
                conn,
                job_id,
                &PlanUpdate {
                    chunked: plan.chunked,
                    chunk_count: plan.chunk_count,
                    duration_seconds: plan.duration_seconds,
                    duration_estimated: plan.duration_estimated,
                    cost_estimate: plan.cost_estimate,
                },
                now,
            )?;

            let event = PipelineEvent::ChunksPlanned {
                job_id: job_id.to_string(),
                chunked: plan.chunked,
                chunk_count: plan.chunk_count,
                reused: false,
            };
            EventBus::record(conn, &event, now)?;

            plan.chunks = chunk_rows;
            Ok((plan.clone(), Some(event)))
        })?;

        if let Some(event) = event {
            log::info!(
                "Planned job {}: chunked={}, {} chunks over {:.0}s (estimated={})",
                job_id,
                plan.chunked,
                plan.chunk_count,
                plan.duration_seconds,
                plan.duration_estimated
            );
            self.events.publish([event]);
        }
        Ok(plan)
    }

    /// Hints first, then the stored duration, then an estimate from payload
    /// size.
    fn resolve_duration(&self, job: &JobRow, hints: &PlanHints) -> Result<(f64, bool)> {
        if let Some(d) = hints.duration_seconds {
            if !d.is_finite() || d < 0.0 {
                return Err(ChunkflowError::Validation(format!(
                    "duration must be a non-negative number, got {d}"
                )));
            }
            if d > 0.0 {
                return Ok((d, false));
            }
        }
        if job.duration_seconds > 0.0 {
            return Ok((job.duration_seconds, job.duration_estimated));
        }

        let bytes = hints
            .payload_bytes
            .or_else(|| job.payload_bytes.and_then(|b| u64::try_from(b).ok()))
            .filter(|b| *b > 0);
        match bytes {
            Some(bytes) => {
                let estimate = estimate_duration_seconds(bytes, self.config.bytes_per_minute);
                log::debug!(
                    "Estimated {:.0}s for job {} from {} bytes",
                    estimate,
                    job.id,
                    bytes
                );
                Ok((estimate, true))
            }
            None => Err(ChunkflowError::Validation(format!(
                "job {} has no known duration and no payload size to estimate from",
                job.id
            ))),
        }
    }
}

fn new_chunk(job_id: &str, span: &ChunkSpan, total: u32, now: DateTime<Utc>) -> ChunkRow {
    ChunkRow {
        id: format!("{}-c{}", job_id, span.index),
        job_id: job_id.to_string(),
        chunk_index: span.index,
        total_chunks: total,
        start_seconds: span.start_seconds,
        end_seconds: span.end_seconds,
        status: ChunkStatus::Pending,
        transcript: Vec::new(),
        frame_refs: Vec::new(),
        quality_level: 0,
        frame_level: 0,
        error: None,
        created_at: now,
        updated_at: now,
    }
}

/// Rebuilds the plan from rows that already exist.
fn reused_plan(mut plan: ChunkPlan, existing: Vec<ChunkRow>) -> ChunkPlan {
    plan.chunked = true;
    plan.chunk_count = existing.len() as u32;
    plan.spans = existing
        .iter()
        .map(|c| ChunkSpan {
            index: c.chunk_index,
            start_seconds: c.start_seconds,
            end_seconds: c.end_seconds,
        })
        .collect();
    plan.duration_seconds = existing.last().map_or(plan.duration_seconds, |c| c.end_seconds);
    plan.chunks = existing;
    plan.reused = true;
    plan
}
