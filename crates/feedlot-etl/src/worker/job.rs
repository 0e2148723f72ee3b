use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::pipeline::IngestOutcome;
use crate::state::FileState;

/// What a worker should do with a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// Parse, validate and load (or stop at the approval gate).
    Ingest,
    /// Load an approved file.
    Load,
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Ingest => f.write_str("ingest"),
            JobKind::Load => f.write_str("load"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct IngestJob {
    pub id: String,
    pub file_id: String,
    pub kind: JobKind,
    pub enqueued_at: DateTime<Utc>,
}

impl IngestJob {
    pub fn ingest(file_id: impl Into<String>) -> Self {
        Self::new(file_id.into(), JobKind::Ingest)
    }

    pub fn load(file_id: impl Into<String>) -> Self {
        Self::new(file_id.into(), JobKind::Load)
    }

    /// Job kind that moves a file on from `state`, if any.
    pub fn for_state(file_id: impl Into<String>, state: FileState) -> Option<Self> {
        match state {
            FileState::Uploaded | FileState::Parsing | FileState::Failed => {
                Some(Self::ingest(file_id))
            }
            FileState::Approved => Some(Self::load(file_id)),
            _ => None,
        }
    }

    fn new(file_id: String, kind: JobKind) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            file_id,
            kind,
            enqueued_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct JobResult {
    pub job_id: String,
    pub file_id: String,
    pub kind: JobKind,
    pub worker: String,
    /// Pipeline errors are flattened to their message.
    pub outcome: Result<IngestOutcome, String>,
    pub duration: Duration,
}

impl JobResult {
    pub fn new(
        job: &IngestJob,
        worker: &str,
        outcome: Result<IngestOutcome, String>,
        duration: Duration,
    ) -> Self {
        Self {
            job_id: job.id.clone(),
            file_id: job.file_id.clone(),
            kind: job.kind,
            worker: worker.to_string(),
            outcome,
            duration,
        }
    }

    /// True when the file reached `loaded` or `awaiting_approval`.
    pub fn is_success(&self) -> bool {
        matches!(self.outcome, Ok(IngestOutcome::Finished { .. }))
    }

    pub fn final_state(&self) -> Option<FileState> {
        match &self.outcome {
            Ok(IngestOutcome::Finished { state, .. }) => Some(*state),
            Ok(IngestOutcome::Failed { .. }) => Some(FileState::Failed),
            Ok(IngestOutcome::Cancelled) => Some(FileState::Cancelled),
            Ok(IngestOutcome::Superseded) | Err(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::IngestReport;
    use crate::state::{FailureKind, RetryDecision};

    #[test]
    fn test_job_constructors() {
        let job = IngestJob::ingest("file-1");
        assert_eq!(job.kind, JobKind::Ingest);
        assert_eq!(job.file_id, "file-1");
        assert!(!job.id.is_empty());

        let other = IngestJob::load("file-1");
        assert_eq!(other.kind, JobKind::Load);
        assert_ne!(job.id, other.id);
    }

    #[test]
    fn test_job_for_state() {
        assert_eq!(
            IngestJob::for_state("f", FileState::Uploaded).map(|j| j.kind),
            Some(JobKind::Ingest)
        );
        assert_eq!(
            IngestJob::for_state("f", FileState::Approved).map(|j| j.kind),
            Some(JobKind::Load)
        );
        assert!(IngestJob::for_state("f", FileState::Loaded).is_none());
        assert!(IngestJob::for_state("f", FileState::AwaitingApproval).is_none());
    }

    #[test]
    fn test_result_success_and_final_state() {
        let job = IngestJob::ingest("file-1");
        let finished = JobResult::new(
            &job,
            "w-0",
            Ok(IngestOutcome::Finished {
                state: FileState::Loaded,
                report: IngestReport::default(),
            }),
            Duration::from_millis(5),
        );
        assert!(finished.is_success());
        assert_eq!(finished.final_state(), Some(FileState::Loaded));

        let failed = JobResult::new(
            &job,
            "w-0",
            Ok(IngestOutcome::Failed {
                kind: FailureKind::Permanent,
                decision: RetryDecision::DeadLetter {
                    max_retries_exceeded: false,
                },
                message: "missing column".to_string(),
            }),
            Duration::ZERO,
        );
        assert!(!failed.is_success());
        assert_eq!(failed.final_state(), Some(FileState::Failed));

        let errored = JobResult::new(&job, "w-0", Err("db gone".to_string()), Duration::ZERO);
        assert!(!errored.is_success());
        assert_eq!(errored.final_state(), None);
    }
}
