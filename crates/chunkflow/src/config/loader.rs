use std::collections::HashSet;
use std::path::Path;

use crate::config::schema::Config;
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../schema/config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<Config, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<Config, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: Config = serde_json::from_value(json_value)?;

    validate_config(&config)?;

    Ok(config)
}

fn validate_schema(json_value: &serde_json::Value) -> Result<(), ConfigError> {
    let schema: serde_json::Value =
        serde_json::from_str(SCHEMA_JSON).map_err(|e| ConfigError::Validation {
            message: format!("Invalid embedded schema JSON: {}", e),
        })?;

    let validator = jsonschema::validator_for(&schema).map_err(|e| ConfigError::Validation {
        message: format!("Failed to compile JSON schema: {}", e),
    })?;

    let error_messages: Vec<String> = validator
        .iter_errors(json_value)
        .map(|e| e.to_string())
        .collect();
    if !error_messages.is_empty() {
        return Err(ConfigError::SchemaValidation {
            errors: error_messages.join("; "),
        });
    }

    Ok(())
}

fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    let planner = &config.planner;
    if planner.chunk_seconds.is_nan() || planner.chunk_seconds <= 0.0 {
        return Err(ConfigError::Validation {
            message: "planner.chunk_seconds must be positive".to_string(),
        });
    }
    if planner.max_parallel_chunks == 0 {
        return Err(ConfigError::Validation {
            message: "planner.max_parallel_chunks must be at least 1".to_string(),
        });
    }

    if config.health.stall_factor <= 1.0 {
        return Err(ConfigError::Validation {
            message: "health.stall_factor must be greater than 1".to_string(),
        });
    }

    if config.worker.worker_count == 0 {
        return Err(ConfigError::Validation {
            message: "worker.worker_count must be at least 1".to_string(),
        });
    }

    let mut seen = HashSet::new();
    for gate in &config.governance.gates {
        if !seen.insert(gate.name.as_str()) {
            return Err(ConfigError::InvalidGate {
                name: gate.name.clone(),
                reason: "duplicate gate name".to_string(),
            });
        }
        if gate.pattern_alternatives().next().is_none() {
            return Err(ConfigError::InvalidGate {
                name: gate.name.clone(),
                reason: "operation_pattern has no alternatives".to_string(),
            });
        }
        if gate.entity_types.is_empty() {
            return Err(ConfigError::InvalidGate {
                name: gate.name.clone(),
                reason: "entity_types must not be empty".to_string(),
            });
        }
    }

    Ok(())
}
