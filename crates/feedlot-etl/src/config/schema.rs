use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::batch::BatchConfig;
use crate::parsing::{DetectionOptions, ParseOptions};
use crate::state::{LifecycleConfig, RetryConfig};
use crate::validate::ValidationConfig;

/// Engine configuration, loaded from a JSON file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EtlConfig {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub workers: WorkersConfig,
    #[serde(default)]
    pub detection: DetectionOptions,
    #[serde(default)]
    pub parsing: ParseOptions,
    #[serde(default)]
    pub mapping: MappingConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub batch: BatchConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub lifecycle: LifecycleConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub aliases: AliasConfig,
}

fn default_version() -> String {
    "1.0".to_string()
}

impl Default for EtlConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            database: DatabaseConfig::default(),
            storage: StorageConfig::default(),
            workers: WorkersConfig::default(),
            detection: DetectionOptions::default(),
            parsing: ParseOptions::default(),
            mapping: MappingConfig::default(),
            validation: ValidationConfig::default(),
            batch: BatchConfig::default(),
            retry: RetryConfig::default(),
            lifecycle: LifecycleConfig::default(),
            logging: LoggingConfig::default(),
            aliases: AliasConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Defaults to `~/.feedlot-etl/data/etl.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Base directory that relative storage locations resolve against.
    #[serde(default)]
    pub root: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkersConfig {
    #[serde(default = "default_worker_count")]
    pub count: usize,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Files claimed per poll and per source.
    #[serde(default = "default_poll_limit")]
    pub poll_limit: u32,
    /// Threads used to cleanse and validate rows. 0 means one per CPU.
    #[serde(default)]
    pub validation_threads: usize,
}

fn default_worker_count() -> usize {
    num_cpus::get().min(4)
}

fn default_poll_interval_ms() -> u64 {
    2_000
}

fn default_poll_limit() -> u32 {
    20
}

impl Default for WorkersConfig {
    fn default() -> Self {
        Self {
            count: default_worker_count(),
            poll_interval_ms: default_poll_interval_ms(),
            poll_limit: default_poll_limit(),
            validation_threads: 0,
        }
    }
}

impl WorkersConfig {
    pub fn validation_threads(&self) -> usize {
        if self.validation_threads == 0 {
            num_cpus::get()
        } else {
            self.validation_threads
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MappingConfig {
    pub case_sensitive: bool,
    /// Largest edit distance offered as a header suggestion.
    pub suggestion_distance: usize,
}

impl Default for MappingConfig {
    fn default() -> Self {
        Self {
            case_sensitive: false,
            suggestion_distance: crate::mapping::mapper::DEFAULT_SUGGESTION_DISTANCE,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

/// Operator-supplied aliases, merged over the built-in tables.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AliasConfig {
    pub shifts: BTreeMap<String, String>,
    pub equipment: BTreeMap<String, String>,
    pub treatment_types: BTreeMap<String, String>,
}
