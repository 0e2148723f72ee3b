//! Run repository: one row per processing attempt of a file.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::state::{FailureKind, FileState};

use super::{from_ms, from_text, parse_column, to_ms, to_text, DatabaseError};

#[derive(Debug, Clone, PartialEq)]
pub struct RunRow {
    pub id: String,
    pub file_id: String,
    pub run_number: u32,
    pub current_state: FileState,
    pub records_total: u64,
    pub records_processed: u64,
    pub records_failed: u64,
    pub retry_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub version: i64,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub last_error_kind: Option<FailureKind>,
    pub last_error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let last_error_kind = match row.get::<_, Option<String>>("last_error_kind")? {
            Some(_) => Some(parse_column(row, "last_error_kind")?),
            None => None,
        };
        let finished_at = match row.get::<_, Option<String>>("finished_at")? {
            Some(text) => Some(from_text(&text)?),
            None => None,
        };
        Ok(Self {
            id: row.get("id")?,
            file_id: row.get("file_id")?,
            run_number: row.get("run_number")?,
            current_state: parse_column(row, "current_state")?,
            records_total: row.get("records_total")?,
            records_processed: row.get("records_processed")?,
            records_failed: row.get("records_failed")?,
            retry_count: row.get("retry_count")?,
            next_retry_at: row.get::<_, Option<i64>>("next_retry_at")?.map(from_ms),
            version: row.get("version")?,
            locked_by: row.get("locked_by")?,
            locked_at: row.get::<_, Option<i64>>("locked_at")?.map(from_ms),
            lock_expires_at: row.get::<_, Option<i64>>("lock_expires_at")?.map(from_ms),
            last_error_kind,
            last_error_message: row.get("last_error_message")?,
            started_at: from_text(&row.get::<_, String>("started_at")?)?,
            finished_at,
            created_at: from_text(&row.get::<_, String>("created_at")?)?,
            updated_at: from_text(&row.get::<_, String>("updated_at")?)?,
        })
    }

    pub fn is_finished(&self) -> bool {
        self.current_state.ends_run()
    }
}

/// Record counters reported by the pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunCounts {
    pub total: u64,
    pub processed: u64,
    pub failed: u64,
}

pub fn insert(conn: &Connection, run: &RunRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO runs (id, file_id, run_number, current_state, records_total,
         records_processed, records_failed, retry_count, next_retry_at, version, locked_by,
         locked_at, lock_expires_at, last_error_kind, last_error_message, started_at,
         finished_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17,
                 ?18, ?19)",
        params![
            run.id,
            run.file_id,
            run.run_number,
            run.current_state.as_str(),
            run.records_total,
            run.records_processed,
            run.records_failed,
            run.retry_count,
            run.next_retry_at.map(to_ms),
            run.version,
            run.locked_by,
            run.locked_at.map(to_ms),
            run.lock_expires_at.map(to_ms),
            run.last_error_kind.map(|k| k.as_str()),
            run.last_error_message,
            to_text(run.started_at),
            run.finished_at.map(to_text),
            to_text(run.created_at),
            to_text(run.updated_at),
        ],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<RunRow>, DatabaseError> {
    Ok(conn
        .query_row("SELECT * FROM runs WHERE id = ?1", params![id], RunRow::from_row)
        .optional()?)
}

pub fn latest_for_file(conn: &Connection, file_id: &str) -> Result<Option<RunRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM runs WHERE file_id = ?1 ORDER BY run_number DESC LIMIT 1",
            params![file_id],
            RunRow::from_row,
        )
        .optional()?)
}

pub fn list_for_file(conn: &Connection, file_id: &str) -> Result<Vec<RunRow>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT * FROM runs WHERE file_id = ?1 ORDER BY run_number ASC")?;
    let rows = stmt
        .query_map(params![file_id], RunRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Mirrors a file transition onto its run, closing the run when the new
/// state ends it.
pub fn update_state(
    conn: &Connection,
    run_id: &str,
    state: FileState,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    let finished_at = state.ends_run().then(|| to_text(now));
    conn.execute(
        "UPDATE runs SET current_state = ?2, version = version + 1,
         finished_at = COALESCE(?3, finished_at), updated_at = ?4
         WHERE id = ?1",
        params![run_id, state.as_str(), finished_at, to_text(now)],
    )?;
    Ok(())
}

pub fn update_counts(
    conn: &Connection,
    run_id: &str,
    counts: RunCounts,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE runs SET records_total = ?2, records_processed = ?3, records_failed = ?4,
         updated_at = ?5 WHERE id = ?1",
        params![
            run_id,
            counts.total,
            counts.processed,
            counts.failed,
            to_text(now)
        ],
    )?;
    Ok(())
}

pub fn record_error(
    conn: &Connection,
    run_id: &str,
    kind: FailureKind,
    message: &str,
    next_retry_at: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE runs SET last_error_kind = ?2, last_error_message = ?3, next_retry_at = ?4,
         updated_at = ?5 WHERE id = ?1",
        params![
            run_id,
            kind.as_str(),
            message,
            next_retry_at.map(to_ms),
            to_text(now)
        ],
    )?;
    Ok(())
}

pub fn set_lease(
    conn: &Connection,
    run_id: &str,
    owner: Option<&str>,
    locked_at: Option<DateTime<Utc>>,
    expires_at: Option<DateTime<Utc>>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE runs SET locked_by = ?2, locked_at = ?3, lock_expires_at = ?4 WHERE id = ?1",
        params![run_id, owner, locked_at.map(to_ms), expires_at.map(to_ms)],
    )?;
    Ok(())
}
