//! Ingestion engine for feedlot operation CSV exports.
//!
//! Files move through an auditable lifecycle (`uploaded` → `parsing` →
//! `parsed` → `validating` → `validated` → `loading` → `loaded`, with
//! approval, failure and cancellation branches). Each run streams the CSV,
//! maps headers onto a canonical dictionary, cleanses and validates rows,
//! stages them and upserts facts by natural key.

pub mod batch;
pub mod catalog;
pub mod cleanse;
pub mod config;
pub mod db;
pub mod error;
pub mod mapping;
pub mod natural_key;
pub mod parsing;
pub mod pipeline;
pub mod record;
pub mod state;
pub mod telemetry;
pub mod validate;
pub mod worker;

pub use catalog::{PipelineType, Shift};
pub use config::{load_config, load_config_from_str, EtlConfig};
pub use db::{Database, DatabaseError};
pub use error::{ConfigError, EtlError, Result, WorkerError};
pub use pipeline::{IngestOutcome, Pipeline, PipelineConfig, PipelineError};
pub use record::{FieldValue, Record};
pub use state::{FileState, NewUpload, StateController, TransitionError};
pub use telemetry::init_logging;
pub use worker::{IngestJob, Poller, WorkerPool};
