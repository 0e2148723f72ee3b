//! Chunked, retried writes of prepared rows.
//!
//! The processor prepares each input, groups the successes into chunks of
//! `batch_size` and hands every chunk to a [`BatchSink`]. A chunk that keeps
//! failing after `max_retries` is reported and skipped; the other chunks are
//! unaffected.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::catalog::PipelineType;

pub mod processor;
pub mod sink;

pub use processor::BatchProcessor;
pub use sink::{BatchSink, ChunkWrite, FactSink, StagingSink, ValidationSink};

/// Identifies the file and run a batch belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelineContext {
    pub organization_id: String,
    pub file_id: String,
    pub run_id: String,
    pub pipeline_type: PipelineType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `retry_delay × attempt`
    Linear,
    /// `retry_delay × 2^(attempt - 1)`
    Exponential,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    pub batch_size: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub backoff: BackoffStrategy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            max_retries: 3,
            retry_delay_ms: 100,
            backoff: BackoffStrategy::Exponential,
        }
    }
}

impl BatchConfig {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.retry_delay_ms;
        let ms = match self.backoff {
            BackoffStrategy::Linear => base.saturating_mul(u64::from(attempt)),
            BackoffStrategy::Exponential => {
                let shift = attempt.saturating_sub(1).min(20);
                base.saturating_mul(1u64 << shift)
            }
        };
        Duration::from_millis(ms)
    }
}

#[derive(Debug, Clone, PartialEq, Error, Serialize)]
pub enum StagingError {
    /// The row could not be prepared for writing.
    #[error("Row {row_number}: {message}")]
    Row { row_number: u64, message: String },

    #[error("Chunk {chunk} ({rows} rows) failed after {attempts} attempts: {message}")]
    Chunk {
        chunk: usize,
        rows: usize,
        attempts: u32,
        message: String,
    },

    #[error("Store error: {0}")]
    Store(String),
}

#[derive(Debug, Clone, Default)]
pub struct BatchResult {
    /// Rows the sink reports as newly written.
    pub inserted_count: usize,
    /// Rows that overwrote an existing record.
    pub updated_count: usize,
    /// Rows rejected during preparation or lost with a failed chunk.
    pub failed_count: usize,
    pub errors: Vec<StagingError>,
    pub duration: Duration,
}

impl BatchResult {
    /// Whether any whole chunk was lost.
    pub fn has_chunk_failures(&self) -> bool {
        self.errors
            .iter()
            .any(|e| matches!(e, StagingError::Chunk { .. }))
    }

    pub fn merge(&mut self, other: BatchResult) {
        self.inserted_count += other.inserted_count;
        self.updated_count += other.updated_count;
        self.failed_count += other.failed_count;
        self.errors.extend(other.errors);
        self.duration += other.duration;
    }
}
