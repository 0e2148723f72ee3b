use std::time::Instant;

use super::sink::{BatchSink, ChunkWrite};
use super::{BatchConfig, BatchResult, PipelineContext, StagingError};

pub struct BatchProcessor<S> {
    sink: S,
    config: BatchConfig,
}

impl<S: BatchSink> BatchProcessor<S> {
    pub fn new(sink: S, config: BatchConfig) -> Self {
        Self { sink, config }
    }

    /// Prepares every item, then writes the prepared records in chunks.
    /// Preparation failures are collected as row errors and never abort.
    pub async fn process<T, F>(
        &self,
        ctx: &PipelineContext,
        items: Vec<T>,
        mut prepare: F,
    ) -> BatchResult
    where
        F: FnMut(T) -> Result<S::Record, StagingError>,
    {
        let started = Instant::now();
        let mut records = Vec::with_capacity(items.len());
        let mut rejected = BatchResult::default();

        for item in items {
            match prepare(item) {
                Ok(record) => records.push(record),
                Err(e) => {
                    rejected.failed_count += 1;
                    rejected.errors.push(e);
                }
            }
        }

        let mut result = self.write(ctx, records).await;
        result.merge(rejected);
        result.duration = started.elapsed();
        result
    }

    /// Writes already prepared records in chunks of `batch_size`.
    pub async fn write(&self, ctx: &PipelineContext, records: Vec<S::Record>) -> BatchResult {
        let started = Instant::now();
        let mut result = BatchResult::default();

        for (index, chunk) in records.chunks(self.config.batch_size.max(1)).enumerate() {
            match self.write_with_retry(ctx, index, chunk).await {
                Ok(write) => {
                    result.inserted_count += write.inserted;
                    result.updated_count += write.updated;
                }
                Err(e) => {
                    log::error!("File {}: {}", ctx.file_id, e);
                    result.failed_count += chunk.len();
                    result.errors.push(e);
                }
            }
        }

        result.duration = started.elapsed();
        result
    }

    async fn write_with_retry(
        &self,
        ctx: &PipelineContext,
        index: usize,
        chunk: &[S::Record],
    ) -> Result<ChunkWrite, StagingError> {
        let mut attempt = 0;
        loop {
            match self.sink.write_chunk(ctx, chunk).await {
                Ok(write) => return Ok(write),
                Err(e) if attempt < self.config.max_retries => {
                    attempt += 1;
                    let delay = self.config.delay_for(attempt);
                    log::warn!(
                        "Chunk {} of file {} failed ({}), retry {}/{} in {:?}",
                        index,
                        ctx.file_id,
                        e,
                        attempt,
                        self.config.max_retries,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    return Err(StagingError::Chunk {
                        chunk: index,
                        rows: chunk.len(),
                        attempts: attempt + 1,
                        message: e.to_string(),
                    })
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::batch::BackoffStrategy;
    use crate::catalog::PipelineType;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;

    /// Fails the first `failures` calls for any chunk containing `poison`.
    struct FlakySink {
        poison: u32,
        failures: u32,
        calls: AtomicU32,
        written: Mutex<Vec<u32>>,
    }

    impl FlakySink {
        fn new(poison: u32, failures: u32) -> Self {
            Self {
                poison,
                failures,
                calls: AtomicU32::new(0),
                written: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl BatchSink for FlakySink {
        type Record = u32;

        async fn write_chunk(
            &self,
            _ctx: &PipelineContext,
            chunk: &[u32],
        ) -> Result<ChunkWrite, StagingError> {
            if chunk.contains(&self.poison) {
                let call = self.calls.fetch_add(1, Ordering::SeqCst);
                if call < self.failures {
                    return Err(StagingError::Store("database is locked".into()));
                }
            }
            self.written.lock().unwrap().extend_from_slice(chunk);
            Ok(ChunkWrite {
                inserted: chunk.len(),
                updated: 0,
            })
        }
    }

    fn ctx() -> PipelineContext {
        PipelineContext {
            organization_id: "org-1".into(),
            file_id: "f1".into(),
            run_id: "r1".into(),
            pipeline_type: PipelineType::Loading,
        }
    }

    fn config(batch_size: usize) -> BatchConfig {
        BatchConfig {
            batch_size,
            max_retries: 2,
            retry_delay_ms: 1,
            backoff: BackoffStrategy::Linear,
        }
    }

    #[tokio::test]
    async fn test_prepare_failures_do_not_abort() {
        let processor = BatchProcessor::new(FlakySink::new(u32::MAX, 0), config(2));
        let result = processor
            .process(&ctx(), vec![1u32, 2, 3, 4, 5], |n| {
                if n == 3 {
                    Err(StagingError::Row {
                        row_number: u64::from(n),
                        message: "unparseable".into(),
                    })
                } else {
                    Ok(n)
                }
            })
            .await;

        assert_eq!(result.inserted_count, 4);
        assert_eq!(result.failed_count, 1);
        assert_eq!(result.errors.len(), 1);
        assert!(!result.has_chunk_failures());
    }

    #[tokio::test]
    async fn test_transient_chunk_failure_is_retried() {
        let sink = FlakySink::new(3, 2);
        let processor = BatchProcessor::new(sink, config(2));
        let result = processor.write(&ctx(), vec![1, 2, 3, 4]).await;

        assert_eq!(result.inserted_count, 4);
        assert_eq!(result.failed_count, 0);
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn test_exhausted_chunk_fails_alone() {
        let sink = FlakySink::new(3, 10);
        let processor = BatchProcessor::new(sink, config(2));
        let result = processor.write(&ctx(), vec![1, 2, 3, 4, 5]).await;

        assert_eq!(result.inserted_count, 3);
        assert_eq!(result.failed_count, 2);
        assert!(result.has_chunk_failures());
        match &result.errors[0] {
            StagingError::Chunk {
                chunk, attempts, ..
            } => {
                assert_eq!(*chunk, 1);
                assert_eq!(*attempts, 3);
            }
            other => panic!("unexpected error: {:?}", other),
        }
        let written = processor.sink.written.lock().unwrap().clone();
        assert_eq!(written, vec![1, 2, 5]);
    }
}
