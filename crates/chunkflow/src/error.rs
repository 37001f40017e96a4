use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ChunkflowError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found")]
    NotFound { entity: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Frame {frame_id} expired before a decision was made")]
    FrameExpired { frame_id: String },

    #[error("Step executor failed: {0}")]
    Executor(String),

    #[error("Worker pool is shut down")]
    PoolClosed,

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Database error: {0}")]
    Database(#[from] crate::db::DatabaseError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl ChunkflowError {
    pub fn not_found(entity: impl std::fmt::Display) -> Self {
        Self::NotFound {
            entity: entity.to_string(),
        }
    }

    /// Returns true for errors that signal a lost race or an already-decided
    /// entity, where the caller may re-read state and retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config JSON: {0}")]
    ParseJson(#[from] serde_json::Error),

    #[error("Config validation failed: {message}")]
    Validation { message: String },

    #[error("Schema validation failed: {errors}")]
    SchemaValidation { errors: String },

    #[error("Invalid approval gate '{name}': {reason}")]
    InvalidGate { name: String, reason: String },
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to create directory '{path}': {source}")]
    CreateDirectory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to write file '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to read file '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Artifact not found: {0}")]
    NotFound(String),

    #[error("Invalid artifact path: {0}")]
    InvalidPath(String),

    #[error("Artifact store lock poisoned")]
    LockPoisoned,
}

#[derive(Error, Debug)]
pub enum LoggingError {
    #[error("Failed to install tracing subscriber: {0}")]
    Subscriber(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("Failed to bridge log records into tracing: {0}")]
    Logger(#[from] log::SetLoggerError),
}

pub type Result<T> = std::result::Result<T, ChunkflowError>;
