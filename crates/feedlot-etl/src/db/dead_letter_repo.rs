//! Dead-letter queue: files that exhausted retries or failed permanently.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::state::{FailureKind, RetryAttempt};

use super::{from_text, json_column, parse_column, to_text, DatabaseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterStatus {
    Pending,
    /// Sent back into the pipeline.
    Resolved,
    Discarded,
}

impl DeadLetterStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadLetterStatus::Pending => "pending",
            DeadLetterStatus::Resolved => "resolved",
            DeadLetterStatus::Discarded => "discarded",
        }
    }
}

impl fmt::Display for DeadLetterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeadLetterStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(DeadLetterStatus::Pending),
            "resolved" => Ok(DeadLetterStatus::Resolved),
            "discarded" => Ok(DeadLetterStatus::Discarded),
            other => Err(format!("Unknown dead letter status: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetterRow {
    pub id: String,
    pub file_id: String,
    pub run_id: Option<String>,
    pub error_kind: FailureKind,
    pub error_message: String,
    pub max_retries_exceeded: bool,
    pub retry_history: Vec<RetryAttempt>,
    pub status: DeadLetterStatus,
    pub resolved_by: Option<String>,
    pub resolution_notes: Option<String>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl DeadLetterRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let resolved_at = match row.get::<_, Option<String>>("resolved_at")? {
            Some(text) => Some(from_text(&text)?),
            None => None,
        };
        Ok(Self {
            id: row.get("id")?,
            file_id: row.get("file_id")?,
            run_id: row.get("run_id")?,
            error_kind: parse_column(row, "error_kind")?,
            error_message: row.get("error_message")?,
            max_retries_exceeded: row.get("max_retries_exceeded")?,
            retry_history: json_column(row, "retry_history")?,
            status: parse_column(row, "status")?,
            resolved_by: row.get("resolved_by")?,
            resolution_notes: row.get("resolution_notes")?,
            resolved_at,
            created_at: from_text(&row.get::<_, String>("created_at")?)?,
            updated_at: from_text(&row.get::<_, String>("updated_at")?)?,
        })
    }
}

pub fn insert(conn: &Connection, entry: &DeadLetterRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO dead_letters (id, file_id, run_id, error_kind, error_message,
         max_retries_exceeded, retry_history, status, resolved_by, resolution_notes,
         resolved_at, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
        params![
            entry.id,
            entry.file_id,
            entry.run_id,
            entry.error_kind.as_str(),
            entry.error_message,
            entry.max_retries_exceeded,
            serde_json::to_string(&entry.retry_history)?,
            entry.status.as_str(),
            entry.resolved_by,
            entry.resolution_notes,
            entry.resolved_at.map(to_text),
            to_text(entry.created_at),
            to_text(entry.updated_at),
        ],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<DeadLetterRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM dead_letters WHERE id = ?1",
            params![id],
            DeadLetterRow::from_row,
        )
        .optional()?)
}

pub fn find_pending_for_file(
    conn: &Connection,
    file_id: &str,
) -> Result<Option<DeadLetterRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM dead_letters WHERE file_id = ?1 AND status = 'pending'
             ORDER BY created_at DESC LIMIT 1",
            params![file_id],
            DeadLetterRow::from_row,
        )
        .optional()?)
}

pub fn list_by_status(
    conn: &Connection,
    status: DeadLetterStatus,
) -> Result<Vec<DeadLetterRow>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT * FROM dead_letters WHERE status = ?1 ORDER BY created_at ASC")?;
    let rows = stmt
        .query_map(params![status.as_str()], DeadLetterRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Closes a pending entry. Returns false when it was already closed.
pub fn resolve(
    conn: &Connection,
    id: &str,
    status: DeadLetterStatus,
    resolved_by: &str,
    notes: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE dead_letters
         SET status = ?2, resolved_by = ?3, resolution_notes = ?4, resolved_at = ?5, updated_at = ?5
         WHERE id = ?1 AND status = 'pending'",
        params![id, status.as_str(), resolved_by, notes, to_text(now)],
    )?;
    Ok(changed == 1)
}
