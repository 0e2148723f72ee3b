use serde::Serialize;

use crate::batch::PipelineContext;
use crate::db::file_repo::FileRow;
use crate::db::run_repo::RunCounts;
use crate::parsing::ParsingError;
use crate::state::FileState;

/// Row and fact totals for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestReport {
    pub rows_total: u64,
    pub rows_loadable: u64,
    pub rows_failed: u64,
    pub parse_errors: usize,
    pub facts_inserted: usize,
    pub facts_updated: usize,
}

/// Mutable state of one claimed run, threaded through the stages.
pub struct RunContext {
    /// Latest stored view of the file; its version is the next CAS guard.
    pub file: FileRow,
    pub run_id: String,
    /// Lease holder for this run.
    pub owner: String,
    pub batch: PipelineContext,
    pub counts: RunCounts,
    pub parse_errors: Vec<ParsingError>,
    pub facts_inserted: usize,
    pub facts_updated: usize,
}

impl RunContext {
    pub fn new(file: FileRow, run_id: String, owner: &str) -> Self {
        let batch = PipelineContext {
            organization_id: file.organization_id.clone(),
            file_id: file.id.clone(),
            run_id: run_id.clone(),
            pipeline_type: file.pipeline_type,
        };
        Self {
            file,
            run_id,
            owner: owner.to_string(),
            batch,
            counts: RunCounts::default(),
            parse_errors: Vec::new(),
            facts_inserted: 0,
            facts_updated: 0,
        }
    }

    pub fn file_id(&self) -> &str {
        &self.file.id
    }

    pub fn version(&self) -> i64 {
        self.file.version
    }

    pub fn state(&self) -> FileState {
        self.file.current_state
    }

    pub fn report(&self) -> IngestReport {
        IngestReport {
            rows_total: self.counts.total,
            rows_loadable: self.counts.processed,
            rows_failed: self.counts.failed,
            parse_errors: self.parse_errors.len(),
            facts_inserted: self.facts_inserted,
            facts_updated: self.facts_updated,
        }
    }

    /// Records the file as returned by a successful transition.
    pub fn advance(&mut self, file: FileRow) {
        self.file = file;
    }
}
