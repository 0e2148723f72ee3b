//! Staging rows: every parsed line of a run, before and after validation.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};

use crate::catalog::PipelineType;
use crate::record::Record;
use crate::validate::{ValidationIssue, ValidationStatus};

use super::{from_text, json_column, parse_column, to_text, DatabaseError};

#[derive(Debug, Clone, PartialEq)]
pub struct NewStagingRow {
    pub organization_id: String,
    pub file_id: String,
    pub run_id: String,
    pub row_number: u64,
    pub pipeline_type: PipelineType,
    pub raw_values: Vec<String>,
    pub mapped_values: Option<Record>,
    pub validation_status: ValidationStatus,
    pub validation_errors: Vec<ValidationIssue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StagingRow {
    pub id: i64,
    pub organization_id: String,
    pub file_id: String,
    pub run_id: String,
    pub row_number: u64,
    pub pipeline_type: PipelineType,
    pub raw_values: Vec<String>,
    pub mapped_values: Option<Record>,
    pub natural_key: Option<String>,
    pub validation_status: ValidationStatus,
    pub validation_errors: Vec<ValidationIssue>,
    pub validation_warnings: Vec<ValidationIssue>,
    pub payload: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl StagingRow {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let mapped_values = match row.get::<_, Option<String>>("mapped_values")? {
            Some(_) => Some(json_column(row, "mapped_values")?),
            None => None,
        };
        let payload = match row.get::<_, Option<String>>("payload")? {
            Some(_) => Some(json_column(row, "payload")?),
            None => None,
        };
        Ok(Self {
            id: row.get("id")?,
            organization_id: row.get("organization_id")?,
            file_id: row.get("file_id")?,
            run_id: row.get("run_id")?,
            row_number: row.get("row_number")?,
            pipeline_type: parse_column(row, "pipeline_type")?,
            raw_values: json_column(row, "raw_values")?,
            mapped_values,
            natural_key: row.get("natural_key")?,
            validation_status: parse_column(row, "validation_status")?,
            validation_errors: json_column(row, "validation_errors")?,
            validation_warnings: json_column(row, "validation_warnings")?,
            payload,
            created_at: from_text(&row.get::<_, String>("created_at")?)?,
            updated_at: from_text(&row.get::<_, String>("updated_at")?)?,
        })
    }
}

/// Result of validating one staged row.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidationUpdate {
    pub id: i64,
    pub status: ValidationStatus,
    pub cleaned_values: Option<Record>,
    pub natural_key: Option<String>,
    pub errors: Vec<ValidationIssue>,
    pub warnings: Vec<ValidationIssue>,
    pub payload: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    pub pending: u64,
    pub valid: u64,
    pub warning: u64,
    pub invalid: u64,
}

impl StatusCounts {
    pub fn total(&self) -> u64 {
        self.pending + self.valid + self.warning + self.invalid
    }

    pub fn loadable(&self) -> u64 {
        self.valid + self.warning
    }
}

/// Inserts rows, skipping any `(run_id, row_number)` already staged so a
/// retried chunk never duplicates. Returns the number of new rows.
pub fn insert_rows(
    conn: &Connection,
    rows: &[NewStagingRow],
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO staging_rows (organization_id, file_id, run_id, row_number, pipeline_type,
         raw_values, mapped_values, validation_status, validation_errors, created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
         ON CONFLICT (run_id, row_number) DO NOTHING",
    )?;
    let now = to_text(now);
    let mut inserted = 0;
    for row in rows {
        let mapped = row
            .mapped_values
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        inserted += stmt.execute(params![
            row.organization_id,
            row.file_id,
            row.run_id,
            row.row_number,
            row.pipeline_type.as_str(),
            serde_json::to_string(&row.raw_values)?,
            mapped,
            row.validation_status.as_str(),
            serde_json::to_string(&row.validation_errors)?,
            now,
        ])?;
    }
    Ok(inserted)
}

/// Rows of a run with `status`, ordered by id, starting after `after_id`.
pub fn page_by_status(
    conn: &Connection,
    run_id: &str,
    status: ValidationStatus,
    after_id: i64,
    limit: u32,
) -> Result<Vec<StagingRow>, DatabaseError> {
    let mut stmt = conn.prepare_cached(
        "SELECT * FROM staging_rows
         WHERE run_id = ?1 AND validation_status = ?2 AND id > ?3
         ORDER BY id ASC LIMIT ?4",
    )?;
    let rows = stmt
        .query_map(
            params![run_id, status.as_str(), after_id, limit],
            StagingRow::from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Loadable (valid or warning) rows of a run, ordered by id.
pub fn page_loadable(
    conn: &Connection,
    run_id: &str,
    after_id: i64,
    limit: u32,
) -> Result<Vec<StagingRow>, DatabaseError> {
    let mut stmt = conn.prepare_cached(
        "SELECT * FROM staging_rows
         WHERE run_id = ?1 AND validation_status IN ('valid', 'warning') AND id > ?2
         ORDER BY id ASC LIMIT ?3",
    )?;
    let rows = stmt
        .query_map(params![run_id, after_id, limit], StagingRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn apply_validation(
    conn: &Connection,
    updates: &[ValidationUpdate],
    now: DateTime<Utc>,
) -> Result<usize, DatabaseError> {
    let mut stmt = conn.prepare_cached(
        "UPDATE staging_rows
         SET validation_status = ?2,
             mapped_values = COALESCE(?3, mapped_values),
             natural_key = ?4,
             validation_errors = ?5,
             validation_warnings = ?6,
             payload = ?7,
             updated_at = ?8
         WHERE id = ?1",
    )?;
    let now = to_text(now);
    let mut updated = 0;
    for update in updates {
        let cleaned = update
            .cleaned_values
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        let payload = update
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        updated += stmt.execute(params![
            update.id,
            update.status.as_str(),
            cleaned,
            update.natural_key,
            serde_json::to_string(&update.errors)?,
            serde_json::to_string(&update.warnings)?,
            payload,
            now,
        ])?;
    }
    Ok(updated)
}

pub fn count_by_status(conn: &Connection, run_id: &str) -> Result<StatusCounts, DatabaseError> {
    let mut stmt = conn.prepare_cached(
        "SELECT validation_status, COUNT(*) FROM staging_rows WHERE run_id = ?1
         GROUP BY validation_status",
    )?;
    let mut counts = StatusCounts::default();
    let rows = stmt.query_map(params![run_id], |r| {
        Ok((r.get::<_, String>(0)?, r.get::<_, u64>(1)?))
    })?;
    for row in rows {
        let (status, count) = row?;
        match status.parse::<ValidationStatus>() {
            Ok(ValidationStatus::Pending) => counts.pending = count,
            Ok(ValidationStatus::Valid) => counts.valid = count,
            Ok(ValidationStatus::Warning) => counts.warning = count,
            Ok(ValidationStatus::Invalid) => counts.invalid = count,
            Err(message) => return Err(DatabaseError::Corrupt { message }),
        }
    }
    Ok(counts)
}

pub fn list_for_run(conn: &Connection, run_id: &str) -> Result<Vec<StagingRow>, DatabaseError> {
    let mut stmt =
        conn.prepare("SELECT * FROM staging_rows WHERE run_id = ?1 ORDER BY row_number ASC")?;
    let rows = stmt
        .query_map(params![run_id], StagingRow::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}
