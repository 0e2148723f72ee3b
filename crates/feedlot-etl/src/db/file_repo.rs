//! File repository: uploaded files, their lifecycle state and soft lease.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::catalog::PipelineType;
use crate::state::{FileState, StateChange};

use super::{from_ms, from_text, json_column, parse_column, to_ms, to_text, DatabaseError};

#[derive(Debug, Clone, PartialEq)]
pub struct FileRow {
    pub id: String,
    pub organization_id: String,
    pub storage_location: String,
    pub checksum: String,
    pub size_bytes: i64,
    pub mime_type: Option<String>,
    pub pipeline_type: PipelineType,
    pub uploaded_by: String,
    pub current_state: FileState,
    pub state_history: Vec<StateChange>,
    pub error_message: Option<String>,
    pub version: i64,
    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub lock_expires_at: Option<DateTime<Utc>>,
    pub dead_lettered: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FileRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get("id")?,
            organization_id: row.get("organization_id")?,
            storage_location: row.get("storage_location")?,
            checksum: row.get("checksum")?,
            size_bytes: row.get("size_bytes")?,
            mime_type: row.get("mime_type")?,
            pipeline_type: parse_column(row, "pipeline_type")?,
            uploaded_by: row.get("uploaded_by")?,
            current_state: parse_column(row, "current_state")?,
            state_history: json_column(row, "state_history")?,
            error_message: row.get("error_message")?,
            version: row.get("version")?,
            locked_by: row.get("locked_by")?,
            locked_at: row.get::<_, Option<i64>>("locked_at")?.map(from_ms),
            lock_expires_at: row.get::<_, Option<i64>>("lock_expires_at")?.map(from_ms),
            dead_lettered: row.get("dead_lettered")?,
            created_at: from_text(&row.get::<_, String>("created_at")?)?,
            updated_at: from_text(&row.get::<_, String>("updated_at")?)?,
        })
    }

    /// True when a lease is held and has not expired at `now`.
    pub fn is_leased_at(&self, now: DateTime<Utc>) -> bool {
        self.locked_by.is_some() && self.lock_expires_at.map(|t| t > now).unwrap_or(false)
    }
}

/// A compare-and-set state change.
#[derive(Debug, Clone)]
pub struct StateWrite<'a> {
    pub file_id: &'a str,
    pub expected_version: i64,
    pub from: FileState,
    pub change: &'a StateChange,
    pub error_message: Option<&'a str>,
}

pub fn insert(conn: &Connection, file: &FileRow) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT INTO files (id, organization_id, storage_location, checksum, size_bytes,
         mime_type, pipeline_type, uploaded_by, current_state, state_history, error_message,
         version, locked_by, locked_at, lock_expires_at, dead_lettered, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18)",
        params![
            file.id,
            file.organization_id,
            file.storage_location,
            file.checksum,
            file.size_bytes,
            file.mime_type,
            file.pipeline_type.as_str(),
            file.uploaded_by,
            file.current_state.as_str(),
            serde_json::to_string(&file.state_history)?,
            file.error_message,
            file.version,
            file.locked_by,
            file.locked_at.map(to_ms),
            file.lock_expires_at.map(to_ms),
            file.dead_lettered,
            to_text(file.created_at),
            to_text(file.updated_at),
        ],
    )?;
    Ok(())
}

pub fn find_by_id(conn: &Connection, id: &str) -> Result<Option<FileRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM files WHERE id = ?1",
            params![id],
            FileRow::from_row,
        )
        .optional()?)
}

/// Latest file with this checksum that is still live (not failed or
/// cancelled) for the organization.
pub fn find_live_by_checksum(
    conn: &Connection,
    organization_id: &str,
    checksum: &str,
) -> Result<Option<FileRow>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM files
             WHERE organization_id = ?1 AND checksum = ?2
               AND current_state NOT IN ('failed', 'cancelled')
             ORDER BY created_at DESC LIMIT 1",
            params![organization_id, checksum],
            FileRow::from_row,
        )
        .optional()?)
}

pub fn list_by_state(
    conn: &Connection,
    state: FileState,
    limit: u32,
) -> Result<Vec<FileRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM files WHERE current_state = ?1 ORDER BY created_at ASC LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![state.as_str(), limit], FileRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Applies a state change only if the row still has the expected version
/// and state. Returns whether the row was updated.
pub fn compare_and_set_state(
    conn: &Connection,
    write: &StateWrite<'_>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE files
         SET current_state = ?1,
             version = version + 1,
             state_history = json_insert(state_history, '$[#]', json(?2)),
             error_message = ?3,
             updated_at = ?4
         WHERE id = ?5 AND version = ?6 AND current_state = ?7",
        params![
            write.change.state.as_str(),
            serde_json::to_string(write.change)?,
            write.error_message,
            to_text(write.change.timestamp),
            write.file_id,
            write.expected_version,
            write.from.as_str(),
        ],
    )?;
    Ok(changed == 1)
}

/// Takes the lease when it is free, expired or already held by `owner`.
pub fn try_acquire_lease(
    conn: &Connection,
    id: &str,
    owner: &str,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE files SET locked_by = ?2, locked_at = ?3, lock_expires_at = ?4
         WHERE id = ?1 AND (locked_by IS NULL OR locked_by = ?2 OR lock_expires_at <= ?3)",
        params![id, owner, to_ms(now), to_ms(expires_at)],
    )?;
    Ok(changed == 1)
}

pub fn renew_lease(
    conn: &Connection,
    id: &str,
    owner: &str,
    expires_at: DateTime<Utc>,
) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE files SET lock_expires_at = ?3 WHERE id = ?1 AND locked_by = ?2",
        params![id, owner, to_ms(expires_at)],
    )?;
    Ok(changed == 1)
}

pub fn release_lease(conn: &Connection, id: &str, owner: &str) -> Result<bool, DatabaseError> {
    let changed = conn.execute(
        "UPDATE files SET locked_by = NULL, locked_at = NULL, lock_expires_at = NULL
         WHERE id = ?1 AND locked_by = ?2",
        params![id, owner],
    )?;
    Ok(changed == 1)
}

pub fn list_stale_leases(
    conn: &Connection,
    now: DateTime<Utc>,
) -> Result<Vec<FileRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM files WHERE locked_by IS NOT NULL AND lock_expires_at <= ?1
         ORDER BY lock_expires_at ASC",
    )?;
    let rows = stmt
        .query_map(params![to_ms(now)], FileRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn set_dead_lettered(
    conn: &Connection,
    id: &str,
    dead_lettered: bool,
    now: DateTime<Utc>,
) -> Result<(), DatabaseError> {
    conn.execute(
        "UPDATE files SET dead_lettered = ?2, updated_at = ?3 WHERE id = ?1",
        params![id, dead_lettered, to_text(now)],
    )?;
    Ok(())
}

/// Failed, not dead-lettered files whose latest run has a retry due.
pub fn list_due_for_retry(
    conn: &Connection,
    now: DateTime<Utc>,
    limit: u32,
) -> Result<Vec<FileRow>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT f.* FROM files f
         JOIN runs r ON r.file_id = f.id
         WHERE f.current_state = 'failed'
           AND f.dead_lettered = 0
           AND r.run_number = (SELECT MAX(run_number) FROM runs WHERE file_id = f.id)
           AND r.next_retry_at IS NOT NULL
           AND r.next_retry_at <= ?1
         ORDER BY r.next_retry_at ASC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![to_ms(now), limit], FileRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
