//! Test harness for isolated test execution.
//!
//! The `TestHarness` struct owns a temporary directory holding the SQLite
//! database and the artifact store, and an `Orchestrator` wired to a
//! `ScriptedExecutor`.

#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::Arc;

use tempfile::TempDir;

use chunkflow::config::Config;
use chunkflow::db::job_repo::JobRow;
use chunkflow::merge::MergeManifest;
use chunkflow::{Database, FileArtifactStore, NewJob, Orchestrator};

use super::builders::{ConfigBuilder, ScriptedExecutor};

pub struct TestHarness {
    /// Kept alive for the lifetime of the harness.
    temp_dir: TempDir,
    pub artifact_dir: PathBuf,
    pub db: Database,
    pub executor: Arc<ScriptedExecutor>,
    pub orchestrator: Orchestrator,
}

impl TestHarness {
    /// A harness with default config and an executor that always succeeds.
    pub fn new() -> Self {
        Self::with(ConfigBuilder::new().build(), ScriptedExecutor::new())
    }

    pub fn with(config: Config, executor: ScriptedExecutor) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let artifact_dir = temp_dir.path().join("artifacts");
        let db = Database::open(&temp_dir.path().join("chunkflow.db"))
            .expect("Failed to open database");
        let executor = Arc::new(executor);
        let orchestrator = Orchestrator::with_parts(
            db.clone(),
            Arc::new(FileArtifactStore::new(&artifact_dir)),
            executor.clone(),
            config,
        )
        .expect("Failed to build orchestrator");

        Self {
            temp_dir,
            artifact_dir,
            db,
            executor,
            orchestrator,
        }
    }

    /// Submits a job with a source reference and a known duration.
    pub fn submit(&self, id: &str, duration_seconds: f64) -> JobRow {
        self.orchestrator
            .submit_job(NewJob {
                id: Some(id.to_string()),
                source_ref: Some(format!("s3://media/{id}.mp4")),
                payload_bytes: None,
                duration_seconds,
            })
            .expect("Failed to submit job")
    }

    pub fn job(&self, id: &str) -> JobRow {
        self.orchestrator.job(id).expect("Failed to load job")
    }

    /// Reads the manifest a merge wrote for `id`.
    pub fn manifest(&self, id: &str) -> MergeManifest {
        let path = self.artifact_dir.join(format!("jobs/{id}/manifest.json"));
        let bytes = std::fs::read(path).expect("Failed to read manifest");
        serde_json::from_slice(&bytes).expect("Failed to parse manifest")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
