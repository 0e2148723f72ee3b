use std::sync::Arc;

use crate::batch::BatchConfig;
use crate::cleanse::AliasTables;
use crate::config::{EtlConfig, MappingConfig};
use crate::parsing::{DetectionOptions, ParseOptions, SAMPLE_BYTES};
use crate::validate::ValidationConfig;

/// Settings one ingestion run needs, resolved once from [`EtlConfig`] and
/// shared by every worker.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub detection: DetectionOptions,
    pub parsing: ParseOptions,
    pub mapping: MappingConfig,
    pub validation: ValidationConfig,
    pub batch: BatchConfig,
    pub aliases: Arc<AliasTables>,
    /// Scoped threads used to validate one page of staged rows.
    pub validation_threads: usize,
    /// Bytes read ahead for separator detection.
    pub sample_bytes: usize,
}

impl PipelineConfig {
    pub fn from_config(config: &EtlConfig) -> Self {
        Self {
            detection: config.detection.clone(),
            parsing: config.parsing.clone(),
            mapping: config.mapping.clone(),
            validation: config.validation.clone(),
            batch: config.batch.clone(),
            aliases: Arc::new(AliasTables::with_config(&config.aliases)),
            validation_threads: config.workers.validation_threads(),
            sample_bytes: SAMPLE_BYTES,
        }
    }

    /// Rows fetched per staging page, bounded by the batch size.
    pub fn page_size(&self) -> u32 {
        u32::try_from(self.batch.batch_size.max(1)).unwrap_or(u32::MAX)
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self::from_config(&EtlConfig::default())
    }
}
