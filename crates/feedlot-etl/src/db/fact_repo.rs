//! Fact table: the deduplicated, loaded business records.

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::catalog::PipelineType;

use super::{conversion_error, from_text, json_column, parse_column, to_text, DatabaseError};

const EVENT_AT_FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

#[derive(Debug, Clone, PartialEq)]
pub struct NewFact {
    pub organization_id: String,
    pub natural_key: String,
    pub pipeline_type: PipelineType,
    pub event_date: NaiveDate,
    pub event_at: NaiveDateTime,
    pub shift: Option<String>,
    pub quantity_kg: f64,
    pub payload: serde_json::Value,
    pub file_id: String,
    pub run_id: String,
    pub row_number: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FactRecord {
    pub organization_id: String,
    pub natural_key: String,
    pub pipeline_type: PipelineType,
    pub event_date: NaiveDate,
    pub event_at: NaiveDateTime,
    pub shift: Option<String>,
    pub quantity_kg: f64,
    pub payload: serde_json::Value,
    pub file_id: String,
    pub run_id: String,
    pub row_number: u64,
    /// How many loads have written this key.
    pub load_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FactRecord {
    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let event_date: String = row.get("event_date")?;
        let event_at: String = row.get("event_at")?;
        Ok(Self {
            organization_id: row.get("organization_id")?,
            natural_key: row.get("natural_key")?,
            pipeline_type: parse_column(row, "pipeline_type")?,
            event_date: NaiveDate::parse_from_str(&event_date, "%Y-%m-%d")
                .map_err(|e| conversion_error(format!("event_date: {}", e)))?,
            event_at: NaiveDateTime::parse_from_str(&event_at, EVENT_AT_FORMAT)
                .map_err(|e| conversion_error(format!("event_at: {}", e)))?,
            shift: row.get("shift")?,
            quantity_kg: row.get("quantity_kg")?,
            payload: json_column(row, "payload")?,
            file_id: row.get("file_id")?,
            run_id: row.get("run_id")?,
            row_number: row.get("row_number")?,
            load_count: row.get("load_count")?,
            created_at: from_text(&row.get::<_, String>("created_at")?)?,
            updated_at: from_text(&row.get::<_, String>("updated_at")?)?,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
}

/// Inserts a fact or overwrites the existing one with the same
/// `(organization_id, natural_key)`. The latest load wins.
pub fn upsert(conn: &Connection, fact: &NewFact, now: DateTime<Utc>) -> Result<UpsertOutcome, DatabaseError> {
    let mut stmt = conn.prepare_cached(
        "INSERT INTO fact_records (organization_id, natural_key, pipeline_type, event_date,
         event_at, shift, quantity_kg, payload, file_id, run_id, row_number, load_count,
         created_at, updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, 1, ?12, ?12)
         ON CONFLICT (organization_id, natural_key) DO UPDATE SET
             pipeline_type = excluded.pipeline_type,
             event_date = excluded.event_date,
             event_at = excluded.event_at,
             shift = excluded.shift,
             quantity_kg = excluded.quantity_kg,
             payload = excluded.payload,
             file_id = excluded.file_id,
             run_id = excluded.run_id,
             row_number = excluded.row_number,
             load_count = fact_records.load_count + 1,
             updated_at = excluded.updated_at
         RETURNING load_count",
    )?;
    let load_count: u32 = stmt.query_row(
        params![
            fact.organization_id,
            fact.natural_key,
            fact.pipeline_type.as_str(),
            fact.event_date.format("%Y-%m-%d").to_string(),
            fact.event_at.format(EVENT_AT_FORMAT).to_string(),
            fact.shift,
            fact.quantity_kg,
            serde_json::to_string(&fact.payload)?,
            fact.file_id,
            fact.run_id,
            fact.row_number,
            to_text(now),
        ],
        |r| r.get(0),
    )?;
    Ok(if load_count == 1 {
        UpsertOutcome::Inserted
    } else {
        UpsertOutcome::Updated
    })
}

pub fn find(
    conn: &Connection,
    organization_id: &str,
    natural_key: &str,
) -> Result<Option<FactRecord>, DatabaseError> {
    Ok(conn
        .query_row(
            "SELECT * FROM fact_records WHERE organization_id = ?1 AND natural_key = ?2",
            params![organization_id, natural_key],
            FactRecord::from_row,
        )
        .optional()?)
}

pub fn list_by_organization(
    conn: &Connection,
    organization_id: &str,
    pipeline: Option<PipelineType>,
) -> Result<Vec<FactRecord>, DatabaseError> {
    let mut stmt = conn.prepare(
        "SELECT * FROM fact_records
         WHERE organization_id = ?1 AND (?2 IS NULL OR pipeline_type = ?2)
         ORDER BY event_at ASC, natural_key ASC",
    )?;
    let rows = stmt
        .query_map(
            params![organization_id, pipeline.map(|p| p.as_str())],
            FactRecord::from_row,
        )?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn count(conn: &Connection, organization_id: &str) -> Result<u64, DatabaseError> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM fact_records WHERE organization_id = ?1",
        params![organization_id],
        |r| r.get(0),
    )?)
}
