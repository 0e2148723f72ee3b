//! Shared test utilities for feedlot-etl integration tests.
//!
//! This module provides:
//! - `TestHarness` owning an in-memory store, an in-memory source and a pipeline
//! - Builders for configs and CSV fixtures

pub mod builders;
pub mod harness;

pub use builders::*;
pub use harness::TestHarness;
