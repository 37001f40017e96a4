pub mod config;
pub mod constraints;
pub mod db;
pub mod degradation;
pub mod error;
pub mod events;
pub mod governance;
pub mod health;
pub mod logging;
pub mod merge;
pub mod model;
pub mod orchestrator;
pub mod planner;
pub mod sla;
pub mod storage;
pub mod worker;

pub use config::{load_config, load_config_from_str, Config};
pub use constraints::{ConstraintChecker, ConstraintReport};
pub use db::Database;
pub use degradation::{mode_for_retry, DegradationProfile, Resolution, MAX_LEVEL};
pub use error::{ChunkflowError, ConfigError, LoggingError, Result, StorageError};
pub use events::{EventBus, OutboxEvent, PipelineEvent};
pub use governance::{FrameGovernor, FrameOutcome, FrameRequest};
pub use health::{HealthMonitor, HealthReport, OutputVerification, RecoveryReport};
pub use logging::init_logging;
pub use merge::{MergeOptions, MergeOutcome, Merger};
pub use orchestrator::{AppliedOperation, ApprovalResult, NewJob, Orchestrator};
pub use planner::{ChunkPlan, ChunkPlanner, PlanHints};
pub use sla::{SlaTable, SlaWindow};
pub use storage::{ArtifactStore, FileArtifactStore, MemoryArtifactStore};
pub use worker::{AdvanceOutcome, StepExecutor, StepOutput, StepRequest, StepRunner, WorkerPool};
