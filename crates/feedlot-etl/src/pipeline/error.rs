use std::io;

use rusqlite::ErrorCode;
use thiserror::Error;

use crate::db::DatabaseError;
use crate::error::ConfigError;
use crate::mapping::MappingError;
use crate::state::{FailureKind, TransitionError};

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Cannot read source '{location}': {source}")]
    Source {
        location: String,
        #[source]
        source: io::Error,
    },

    #[error("Read failed: {0}")]
    Io(#[from] io::Error),

    #[error("Header mapping failed: {0}")]
    Mapping(#[from] MappingError),

    #[error(transparent)]
    Transition(#[from] TransitionError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Invalid pipeline configuration: {0}")]
    Config(#[from] ConfigError),
}

impl PipelineError {
    /// Retry classification for a file-level failure.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            PipelineError::Source { source, .. } => io_kind(source),
            PipelineError::Io(e) => io_kind(e),
            PipelineError::Mapping(_) => FailureKind::Permanent,
            PipelineError::Transition(e) => match e {
                TransitionError::Database(db) => database_kind(db),
                TransitionError::LeaseHeld { .. }
                | TransitionError::VersionConflict { .. }
                | TransitionError::InvalidTransition { .. } => FailureKind::Transient,
                TransitionError::NotFound { .. }
                | TransitionError::ApprovalRequired { .. }
                | TransitionError::DuplicateUpload { .. }
                | TransitionError::DeadLetterClosed { .. } => FailureKind::Permanent,
            },
            PipelineError::Database(e) => database_kind(e),
            PipelineError::Config(_) => FailureKind::Permanent,
        }
    }

    /// Another actor moved the file or took its lease. The pipeline stops
    /// without recording a failure.
    pub fn is_superseded(&self) -> bool {
        matches!(
            self,
            PipelineError::Transition(
                TransitionError::VersionConflict { .. }
                    | TransitionError::LeaseHeld { .. }
                    | TransitionError::InvalidTransition { .. }
            )
        )
    }
}

fn io_kind(error: &io::Error) -> FailureKind {
    match error.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::PermissionDenied | io::ErrorKind::InvalidData => {
            FailureKind::Permanent
        }
        io::ErrorKind::OutOfMemory => FailureKind::Resource,
        _ => FailureKind::Transient,
    }
}

fn database_kind(error: &DatabaseError) -> FailureKind {
    match error {
        DatabaseError::Sqlite(rusqlite::Error::SqliteFailure(failure, _)) => match failure.code {
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => FailureKind::Transient,
            ErrorCode::DiskFull | ErrorCode::OutOfMemory => FailureKind::Resource,
            _ => FailureKind::Permanent,
        },
        DatabaseError::Sqlite(_) => FailureKind::Transient,
        DatabaseError::Io { .. } => FailureKind::Resource,
        DatabaseError::LockPoisoned => FailureKind::Transient,
        DatabaseError::Json(_) | DatabaseError::Migration { .. } | DatabaseError::Corrupt { .. } => {
            FailureKind::Permanent
        }
    }
}
