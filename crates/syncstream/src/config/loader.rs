use std::path::Path;

use crate::config::schema::{StreamConfig, COLLECTION_PLACEHOLDER, JOB_ID_PLACEHOLDER};
use crate::error::ConfigError;

const SCHEMA_JSON: &str = include_str!("../../schema/stream-config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<StreamConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<StreamConfig, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: StreamConfig = serde_json::from_value(json_value)?;

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

fn validate_config(config: &StreamConfig) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if !config.sync_stream_path.contains(JOB_ID_PLACEHOLDER) {
        return Err(ConfigError::Validation {
            message: format!("sync_stream_path must contain '{}'", JOB_ID_PLACEHOLDER),
        });
    }

    if !config.query_stream_path.contains(COLLECTION_PLACEHOLDER) {
        return Err(ConfigError::Validation {
            message: format!(
                "query_stream_path must contain '{}'",
                COLLECTION_PLACEHOLDER
            ),
        });
    }

    if config.health.stale_after_secs < config.health.interval_secs {
        return Err(ConfigError::Validation {
            message: format!(
                "health.stale_after_secs ({}) must not be shorter than health.interval_secs ({})",
                config.health.stale_after_secs, config.health.interval_secs
            ),
        });
    }

    Ok(())
}
