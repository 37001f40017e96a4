use serde::{Deserialize, Serialize};

use crate::model::{ApprovalGate, AutoApproveCondition, EntityType};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub version: String,
    /// Defaults to `~/.chunkflow/data/chunkflow.db`.
    #[serde(default)]
    pub database_path: Option<String>,
    #[serde(default = "default_artifact_directory")]
    pub artifact_directory: String,
    #[serde(default)]
    pub planner: PlannerConfig,
    #[serde(default)]
    pub governance: GovernanceConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub merge: MergeConfig,
    #[serde(default)]
    pub worker: WorkerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

fn default_artifact_directory() -> String {
    "./artifacts".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: "1.0".to_string(),
            database_path: None,
            artifact_directory: default_artifact_directory(),
            planner: PlannerConfig::default(),
            governance: GovernanceConfig::default(),
            health: HealthConfig::default(),
            merge: MergeConfig::default(),
            worker: WorkerConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannerConfig {
    #[serde(default = "default_chunk_seconds")]
    pub chunk_seconds: f64,
    /// Jobs shorter than this are processed whole unless forced.
    #[serde(default = "default_threshold_seconds")]
    pub threshold_seconds: f64,
    #[serde(default = "default_max_parallel_chunks")]
    pub max_parallel_chunks: usize,
    /// Heuristic used to estimate duration from payload size.
    #[serde(default = "default_bytes_per_minute")]
    pub bytes_per_minute: u64,
    #[serde(default = "default_cost_per_minute")]
    pub cost_per_minute: f64,
}

fn default_chunk_seconds() -> f64 {
    600.0
}

fn default_threshold_seconds() -> f64 {
    1800.0
}

fn default_max_parallel_chunks() -> usize {
    10
}

fn default_bytes_per_minute() -> u64 {
    10 * 1024 * 1024
}

fn default_cost_per_minute() -> f64 {
    0.05
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            chunk_seconds: default_chunk_seconds(),
            threshold_seconds: default_threshold_seconds(),
            max_parallel_chunks: default_max_parallel_chunks(),
            bytes_per_minute: default_bytes_per_minute(),
            cost_per_minute: default_cost_per_minute(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GovernanceConfig {
    /// Seconds a frame may stay pending before it expires.
    #[serde(default = "default_frame_ttl_seconds")]
    pub frame_ttl_seconds: i64,
    /// Evaluated in order; the first match wins.
    #[serde(default = "default_gates")]
    pub gates: Vec<ApprovalGate>,
}

fn default_frame_ttl_seconds() -> i64 {
    3600
}

/// Gates installed when none are configured.
pub fn default_gates() -> Vec<ApprovalGate> {
    let data_check = |fields: &[&str]| AutoApproveCondition::DataCheck {
        fields: fields.iter().map(|f| f.to_string()).collect(),
    };

    vec![
        ApprovalGate {
            name: "failure_marking".to_string(),
            operation_pattern: "mark_failed|reject".to_string(),
            entity_types: vec![EntityType::Job, EntityType::Chunk],
            requires_approval: true,
            auto_approve_conditions: vec![],
            active: true,
        },
        ApprovalGate {
            name: "output_recovery".to_string(),
            operation_pattern: "recover".to_string(),
            entity_types: vec![EntityType::Job],
            requires_approval: true,
            auto_approve_conditions: vec![data_check(&["source_ref"])],
            active: true,
        },
        ApprovalGate {
            name: "job_merge".to_string(),
            operation_pattern: "merge".to_string(),
            entity_types: vec![EntityType::Job],
            requires_approval: true,
            auto_approve_conditions: vec![data_check(&["source_ref", "chunk_count"])],
            active: true,
        },
        ApprovalGate {
            name: "unit_approval".to_string(),
            operation_pattern: "approve_work_unit".to_string(),
            entity_types: vec![EntityType::WorkUnit],
            requires_approval: true,
            auto_approve_conditions: vec![],
            active: true,
        },
    ]
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            frame_ttl_seconds: default_frame_ttl_seconds(),
            gates: default_gates(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthConfig {
    #[serde(default = "default_heartbeat_stale_seconds")]
    pub heartbeat_stale_seconds: i64,
    /// A unit is stalled once elapsed exceeds expected times this factor.
    #[serde(default = "default_stall_factor")]
    pub stall_factor: f64,
    #[serde(default = "default_sla_safety_multiplier")]
    pub sla_safety_multiplier: f64,
    /// Unit length the SLA baselines are defined for.
    #[serde(default = "default_reference_unit_seconds")]
    pub reference_unit_seconds: f64,
    #[serde(default = "default_sla_floor_seconds")]
    pub sla_floor_seconds: f64,
}

fn default_heartbeat_stale_seconds() -> i64 {
    600
}

fn default_stall_factor() -> f64 {
    2.0
}

fn default_sla_safety_multiplier() -> f64 {
    1.5
}

fn default_reference_unit_seconds() -> f64 {
    600.0
}

fn default_sla_floor_seconds() -> f64 {
    60.0
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            heartbeat_stale_seconds: default_heartbeat_stale_seconds(),
            stall_factor: default_stall_factor(),
            sla_safety_multiplier: default_sla_safety_multiplier(),
            reference_unit_seconds: default_reference_unit_seconds(),
            sla_floor_seconds: default_sla_floor_seconds(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MergeConfig {
    /// Sampling rate frames were extracted at; converts a frame's position
    /// within its chunk into a time offset.
    #[serde(default = "default_frame_sample_rate_hz")]
    pub frame_sample_rate_hz: f64,
}

fn default_frame_sample_rate_hz() -> f64 {
    1.0
}

impl Default for MergeConfig {
    fn default() -> Self {
        Self {
            frame_sample_rate_hz: default_frame_sample_rate_hz(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    #[serde(default = "default_worker_count")]
    pub worker_count: usize,
    /// Failed attempts allowed before a chunk is proposed for failure.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_worker_count() -> usize {
    num_cpus::get()
}

fn default_max_retries() -> u32 {
    6
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            max_retries: default_max_retries(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}
