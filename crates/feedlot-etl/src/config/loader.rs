use std::path::Path;

use crate::config::schema::EtlConfig;
use crate::error::ConfigError;
use crate::validate::BusinessValidator;
use crate::catalog::PipelineType;

const SCHEMA_JSON: &str = include_str!("../../../../schema/etl-config-v1.json");

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<EtlConfig, ConfigError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
        path: path.to_path_buf(),
        source: e,
    })?;

    load_config_from_str(&content)
}

pub fn load_config_from_str(content: &str) -> Result<EtlConfig, ConfigError> {
    let json_value: serde_json::Value = serde_json::from_str(content)?;

    validate_schema(&json_value)?;

    let config: EtlConfig = serde_json::from_value(json_value)?;

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

/// Checks the schema cannot express.
pub fn validate_config(config: &EtlConfig) -> Result<(), ConfigError> {
    if config.version != "1.0" {
        return Err(ConfigError::Validation {
            message: format!("Unsupported config version: {}", config.version),
        });
    }

    if config.batch.batch_size == 0 || config.parsing.batch_size == 0 {
        return Err(ConfigError::Validation {
            message: "Batch sizes must be positive".to_string(),
        });
    }

    if !config.parsing.has_headers {
        return Err(ConfigError::Validation {
            message: "parsing.has_headers must be true: columns are mapped by header".to_string(),
        });
    }

    if config.workers.count == 0 {
        return Err(ConfigError::Validation {
            message: "At least one worker is required".to_string(),
        });
    }

    if config.detection.candidates.iter().any(|c| !c.is_ascii()) || !config.detection.fallback.is_ascii() {
        return Err(ConfigError::Validation {
            message: "Separator candidates must be single ASCII characters".to_string(),
        });
    }

    for pipeline in PipelineType::ALL {
        let range = config.validation.thresholds.for_pipeline(pipeline);
        if range.low > range.high {
            return Err(ConfigError::Validation {
                message: format!(
                    "{} threshold low {} is above high {}",
                    pipeline, range.low, range.high
                ),
            });
        }
        // Surfaces operating window errors at load time.
        BusinessValidator::new(pipeline, &config.validation)?;
    }

    Ok(())
}
