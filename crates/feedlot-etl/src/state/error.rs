use thiserror::Error;

use crate::db::DatabaseError;

use super::FileState;

/// Rejections from the state controller. None of these mutate the store.
#[derive(Debug, Error)]
pub enum TransitionError {
    #[error("File not found: {file_id}")]
    NotFound { file_id: String },

    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition { from: FileState, to: FileState },

    #[error("Version conflict on {file_id}: expected {expected}, found {actual}")]
    VersionConflict {
        file_id: String,
        expected: i64,
        actual: i64,
    },

    #[error("File {file_id} requires approval before loading")]
    ApprovalRequired { file_id: String },

    #[error("File {file_id} is leased by {owner}")]
    LeaseHeld { file_id: String, owner: String },

    #[error("Duplicate upload: file {existing_id} has the same checksum")]
    DuplicateUpload { existing_id: String },

    #[error("Dead letter {id} not found or already closed")]
    DeadLetterClosed { id: String },

    #[error(transparent)]
    Database(#[from] DatabaseError),
}
