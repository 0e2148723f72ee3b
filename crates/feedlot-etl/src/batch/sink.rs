//! Destinations for chunked writes. Each SQLite sink commits one chunk per
//! transaction on the blocking pool.

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Connection;

use crate::db::fact_repo::{self, NewFact, UpsertOutcome};
use crate::db::staging_repo::{self, NewStagingRow, ValidationUpdate};
use crate::db::{Database, DatabaseError};

use super::{PipelineContext, StagingError};

/// What one chunk write did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChunkWrite {
    pub inserted: usize,
    pub updated: usize,
}

#[async_trait]
pub trait BatchSink: Send + Sync {
    type Record: Clone + Send + Sync + 'static;

    /// Writes a whole chunk or nothing.
    async fn write_chunk(
        &self,
        ctx: &PipelineContext,
        chunk: &[Self::Record],
    ) -> Result<ChunkWrite, StagingError>;
}

/// Appends parsed rows to `staging_rows`.
#[derive(Clone)]
pub struct StagingSink {
    db: Database,
}

impl StagingSink {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl BatchSink for StagingSink {
    type Record = NewStagingRow;

    async fn write_chunk(
        &self,
        _ctx: &PipelineContext,
        chunk: &[NewStagingRow],
    ) -> Result<ChunkWrite, StagingError> {
        let rows = chunk.to_vec();
        let inserted = blocking_tx(&self.db, move |conn| {
            staging_repo::insert_rows(conn, &rows, Utc::now())
        })
        .await?;
        Ok(ChunkWrite {
            inserted,
            updated: 0,
        })
    }
}

/// Writes validation verdicts back onto staged rows.
#[derive(Clone)]
pub struct ValidationSink {
    db: Database,
}

impl ValidationSink {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl BatchSink for ValidationSink {
    type Record = ValidationUpdate;

    async fn write_chunk(
        &self,
        _ctx: &PipelineContext,
        chunk: &[ValidationUpdate],
    ) -> Result<ChunkWrite, StagingError> {
        let updates = chunk.to_vec();
        let updated = blocking_tx(&self.db, move |conn| {
            staging_repo::apply_validation(conn, &updates, Utc::now())
        })
        .await?;
        Ok(ChunkWrite {
            inserted: 0,
            updated,
        })
    }
}

/// Upserts facts by `(organization_id, natural_key)`.
#[derive(Clone)]
pub struct FactSink {
    db: Database,
}

impl FactSink {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl BatchSink for FactSink {
    type Record = NewFact;

    async fn write_chunk(
        &self,
        _ctx: &PipelineContext,
        chunk: &[NewFact],
    ) -> Result<ChunkWrite, StagingError> {
        let facts = chunk.to_vec();
        blocking_tx(&self.db, move |conn| {
            let now = Utc::now();
            let mut write = ChunkWrite::default();
            for fact in &facts {
                match fact_repo::upsert(conn, fact, now)? {
                    UpsertOutcome::Inserted => write.inserted += 1,
                    UpsertOutcome::Updated => write.updated += 1,
                }
            }
            Ok(write)
        })
        .await
    }
}

async fn blocking_tx<T, F>(db: &Database, f: F) -> Result<T, StagingError>
where
    F: FnOnce(&Connection) -> Result<T, DatabaseError> + Send + 'static,
    T: Send + 'static,
{
    let db = db.clone();
    tokio::task::spawn_blocking(move || db.with_tx(f))
        .await
        .map_err(|e| StagingError::Store(format!("write task failed: {}", e)))?
        .map_err(|e| StagingError::Store(e.to_string()))
}
