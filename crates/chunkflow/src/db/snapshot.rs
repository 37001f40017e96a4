//! Loads the current state of any governed entity by reference.

use rusqlite::Connection;
use serde_json::Value;

use super::chunk_repo::{self, ChunkRow};
use super::job_repo::{self, JobRow};
use super::work_unit_repo::{self, WorkUnitRow};
use super::{to_json_text, DatabaseError};
use crate::model::{EntityRef, EntityType};

/// Current state of a frame target.
#[derive(Debug, Clone, PartialEq)]
pub enum EntitySnapshot {
    Job(JobRow),
    Chunk(ChunkRow),
    WorkUnit(WorkUnitRow),
}

impl EntitySnapshot {
    /// Loads the entity. `None` when it does not exist.
    pub fn load(conn: &Connection, target: &EntityRef) -> Result<Option<Self>, DatabaseError> {
        let snapshot = match target.entity_type {
            EntityType::Job => job_repo::find_by_id(conn, &target.id)?.map(Self::Job),
            EntityType::Chunk => chunk_repo::find_by_id(conn, &target.id)?.map(Self::Chunk),
            EntityType::WorkUnit => {
                work_unit_repo::find_by_id(conn, &target.id)?.map(Self::WorkUnit)
            }
        };
        Ok(snapshot)
    }

    /// The entity as a JSON object, used for auto-approve field checks and
    /// the transition audit log.
    pub fn to_json(&self) -> Result<Value, DatabaseError> {
        let value = match self {
            Self::Job(j) => serde_json::to_value(j)?,
            Self::Chunk(c) => serde_json::to_value(c)?,
            Self::WorkUnit(u) => serde_json::to_value(u)?,
        };
        Ok(value)
    }

    /// Compact JSON text of the entity.
    pub fn to_json_text(&self) -> Result<String, DatabaseError> {
        to_json_text(&self.to_json()?)
    }

    /// The job that owns this entity (itself for a job).
    pub fn owning_job_id(&self) -> &str {
        match self {
            Self::Job(j) => &j.id,
            Self::Chunk(c) => &c.job_id,
            Self::WorkUnit(u) => &u.job_id,
        }
    }

    /// Frame refs and transcript length, where the entity carries them.
    pub fn derivative_counts(&self) -> Option<(usize, usize)> {
        match self {
            Self::Job(j) => Some((j.frame_refs.len(), j.transcript.len())),
            Self::Chunk(c) => Some((c.frame_refs.len(), c.transcript.len())),
            Self::WorkUnit(_) => None,
        }
    }
}
