//! Outbound pipeline events.
//!
//! Each event is written to the outbox inside the transaction that made the
//! state change, then broadcast to live subscribers once that transaction
//! commits. A scheduler drives the next stage from the outbox, not from the
//! broadcast, so a lagging or absent subscriber loses nothing.

use chrono::{DateTime, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::db::{event_repo, Database, DatabaseError};
use crate::model::{ApprovalStatus, PipelineStep};

const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum PipelineEvent {
    ChunksPlanned {
        job_id: String,
        chunked: bool,
        chunk_count: u32,
        /// True when an earlier plan was returned instead of a new one.
        reused: bool,
    },
    FrameCreated {
        frame_id: String,
        target: String,
        operation: String,
        status: ApprovalStatus,
    },
    FrameApproved {
        frame_id: String,
        target: String,
        operation: String,
        approver: String,
    },
    FrameRejected {
        frame_id: String,
        target: String,
        operation: String,
        reason: String,
    },
    StepQueued {
        unit_id: String,
        job_id: String,
        chunk_id: Option<String>,
        step: PipelineStep,
        retry_count: u32,
    },
    StepCompleted {
        unit_id: String,
        job_id: String,
        chunk_id: Option<String>,
        step: PipelineStep,
        quality_level: u8,
    },
    StepFailed {
        unit_id: String,
        job_id: String,
        chunk_id: Option<String>,
        step: PipelineStep,
        retry_count: u32,
        error: String,
        will_retry: bool,
    },
    JobMerged {
        job_id: String,
        artifact_ref: String,
        merged_chunks: u32,
        quality_level: u8,
        degraded: bool,
    },
    RecoveryRequested {
        job_id: String,
        frame_id: String,
        steps: Vec<PipelineStep>,
    },
}

impl PipelineEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineEvent::ChunksPlanned { .. } => "ChunksPlanned",
            PipelineEvent::FrameCreated { .. } => "FrameCreated",
            PipelineEvent::FrameApproved { .. } => "FrameApproved",
            PipelineEvent::FrameRejected { .. } => "FrameRejected",
            PipelineEvent::StepQueued { .. } => "StepQueued",
            PipelineEvent::StepCompleted { .. } => "StepCompleted",
            PipelineEvent::StepFailed { .. } => "StepFailed",
            PipelineEvent::JobMerged { .. } => "JobMerged",
            PipelineEvent::RecoveryRequested { .. } => "RecoveryRequested",
        }
    }
}

/// An undelivered outbox entry.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboxEvent {
    pub id: i64,
    pub event: PipelineEvent,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct EventBus {
    db: Database,
    sender: broadcast::Sender<PipelineEvent>,
}

impl EventBus {
    pub fn new(db: Database) -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { db, sender }
    }

    /// Appends the event to the outbox on `conn`. Call inside the
    /// transaction that performs the change it describes.
    pub fn record(
        conn: &Connection,
        event: &PipelineEvent,
        now: DateTime<Utc>,
    ) -> Result<i64, DatabaseError> {
        let payload = serde_json::to_value(event)?;
        event_repo::append(conn, event.kind(), &payload, now)
    }

    /// Sends committed events to live subscribers. Having no subscribers is
    /// not an error.
    pub fn publish(&self, events: impl IntoIterator<Item = PipelineEvent>) {
        for event in events {
            log::debug!("Publishing {} event", event.kind());
            let _ = self.sender.send(event);
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.sender.subscribe()
    }

    /// Unacknowledged outbox entries, oldest first. Entries whose payload no
    /// longer decodes are logged and skipped.
    pub fn drain(&self, limit: u32) -> Result<Vec<OutboxEvent>, DatabaseError> {
        let rows = self.db.with_conn(|c| event_repo::pending(c, limit))?;
        let mut events = Vec::with_capacity(rows.len());
        for row in rows {
            match serde_json::from_value::<PipelineEvent>(row.payload) {
                Ok(event) => events.push(OutboxEvent {
                    id: row.id,
                    event,
                    created_at: row.created_at,
                }),
                Err(e) => log::warn!("Skipping undecodable outbox event {}: {}", row.id, e),
            }
        }
        Ok(events)
    }

    pub fn ack(&self, ids: &[i64]) -> Result<usize, DatabaseError> {
        let now = Utc::now();
        self.db.with_conn(|c| event_repo::ack(c, ids, now))
    }
}
