use thiserror::Error;

/// File-level header mapping failures. Any of these stops the file before
/// row processing starts.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MappingError {
    #[error("Required columns missing: {}", fields.join(", "))]
    MissingRequired { fields: Vec<String> },

    #[error("File has no header row")]
    NoHeaders,

    #[error("Rows cannot be mapped before headers are analyzed")]
    NotAnalyzed,
}
