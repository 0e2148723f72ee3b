//! File ingestion pipeline: parse, stage, validate and load one file while
//! driving it through the lifecycle.

pub mod config;
pub mod context;
pub mod error;
pub mod progress;
pub mod runner;
pub mod source;

pub use config::PipelineConfig;
pub use context::{IngestReport, RunContext};
pub use error::PipelineError;
pub use progress::{BroadcastProgress, NoopProgress, ProgressEvent, ProgressReporter, ProgressUpdate};
pub use runner::{IngestOutcome, Pipeline};
pub use source::{FsSourceProvider, MemorySourceProvider, SourceProvider, SourceReader};
