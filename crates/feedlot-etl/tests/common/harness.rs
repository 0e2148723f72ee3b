//! Test harness for isolated pipeline runs.
//!
//! The `TestHarness` struct owns everything one test needs:
//! - An in-memory SQLite store with migrations applied
//! - An in-memory source that uploads are written to
//! - A `Pipeline` built from an `EtlConfig`

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use feedlot_etl::config::EtlConfig;
use feedlot_etl::db::fact_repo::FactRecord;
use feedlot_etl::pipeline::{
    IngestOutcome, MemorySourceProvider, NoopProgress, Pipeline, PipelineConfig, SourceProvider,
};
use feedlot_etl::state::{FileState, NewUpload, StateController};
use feedlot_etl::{Database, PipelineType};

use super::builders::ORG_A;

pub const WORKER: &str = "test-worker";

pub struct TestHarness {
    pub pipeline: Arc<Pipeline>,
    pub memory: Arc<MemorySourceProvider>,
    pub config: EtlConfig,
    uploads: AtomicUsize,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(EtlConfig::default())
    }

    pub fn with_config(config: EtlConfig) -> Self {
        let memory = Arc::new(MemorySourceProvider::new());
        Self::build(config, Arc::clone(&memory), memory)
    }

    /// Pipeline reads from `source` instead of the in-memory uploads.
    pub fn with_source(config: EtlConfig, source: Arc<dyn SourceProvider>) -> Self {
        Self::build(config, Arc::new(MemorySourceProvider::new()), source)
    }

    fn build(
        config: EtlConfig,
        memory: Arc<MemorySourceProvider>,
        source: Arc<dyn SourceProvider>,
    ) -> Self {
        let db = Database::open_in_memory().expect("in-memory database");
        let controller =
            StateController::new(db, config.retry.clone(), config.lifecycle.clone());
        let pipeline = Pipeline::new(
            controller,
            Arc::new(PipelineConfig::from_config(&config)),
            source,
        );
        Self {
            pipeline: Arc::new(pipeline),
            memory,
            config,
            uploads: AtomicUsize::new(0),
        }
    }

    pub fn controller(&self) -> &StateController {
        self.pipeline.controller()
    }

    /// Stores `csv` under a fresh location and registers it for `ORG_A`.
    pub fn upload(&self, pipeline_type: PipelineType, csv: &str) -> String {
        self.upload_for(ORG_A, pipeline_type, csv)
    }

    pub fn upload_for(&self, organization_id: &str, pipeline_type: PipelineType, csv: &str) -> String {
        let n = self.uploads.fetch_add(1, Ordering::SeqCst);
        let location = format!("uploads/{}/{}.csv", pipeline_type, n);
        self.memory.insert(&location, csv);
        self.controller()
            .register_upload(NewUpload {
                organization_id: organization_id.to_string(),
                storage_location: location,
                checksum: format!("checksum-{}", n),
                size_bytes: csv.len() as i64,
                mime_type: Some("text/csv".to_string()),
                pipeline_type,
                uploaded_by: "operator@farm".to_string(),
            })
            .expect("upload should register")
            .id
    }

    pub async fn ingest(&self, file_id: &str) -> IngestOutcome {
        self.pipeline
            .ingest(file_id, WORKER, &NoopProgress)
            .await
            .expect("ingest should not error")
    }

    pub async fn load(&self, file_id: &str) -> IngestOutcome {
        self.pipeline
            .load(file_id, WORKER, &NoopProgress)
            .await
            .expect("load should not error")
    }

    pub fn state(&self, file_id: &str) -> FileState {
        self.controller()
            .get_file(file_id)
            .expect("file exists")
            .current_state
    }

    pub fn facts(&self, organization_id: &str) -> Vec<FactRecord> {
        self.controller()
            .facts(organization_id, None)
            .expect("facts query")
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
