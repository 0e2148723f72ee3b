//! Append-only run log.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};

use crate::state::FileState;

use super::{from_text, json_column, to_text, DatabaseError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl std::str::FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("Unknown log level: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RunLogEntry {
    pub id: Option<i64>,
    pub run_id: Option<String>,
    pub file_id: String,
    pub level: LogLevel,
    pub message: String,
    pub details: serde_json::Value,
    pub state: Option<FileState>,
    pub previous_state: Option<FileState>,
    pub created_at: DateTime<Utc>,
}

impl RunLogEntry {
    pub fn new(file_id: &str, run_id: Option<&str>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            id: None,
            run_id: run_id.map(str::to_string),
            file_id: file_id.to_string(),
            level,
            message: message.into(),
            details: serde_json::Value::Object(Default::default()),
            state: None,
            previous_state: None,
            created_at: Utc::now(),
        }
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn with_states(mut self, previous: FileState, state: FileState) -> Self {
        self.previous_state = Some(previous);
        self.state = Some(state);
        self
    }

    fn from_row(row: &Row<'_>) -> Result<Self, rusqlite::Error> {
        let state = row
            .get::<_, Option<String>>("state")?
            .map(|s| s.parse::<FileState>())
            .transpose()
            .map_err(super::conversion_error)?;
        let previous_state = row
            .get::<_, Option<String>>("previous_state")?
            .map(|s| s.parse::<FileState>())
            .transpose()
            .map_err(super::conversion_error)?;
        Ok(Self {
            id: row.get("id")?,
            run_id: row.get("run_id")?,
            file_id: row.get("file_id")?,
            level: super::parse_column(row, "level")?,
            message: row.get("message")?,
            details: json_column(row, "details")?,
            state,
            previous_state,
            created_at: from_text(&row.get::<_, String>("created_at")?)?,
        })
    }
}

pub fn append(conn: &Connection, entry: &RunLogEntry) -> Result<i64, DatabaseError> {
    conn.execute(
        "INSERT INTO run_logs (run_id, file_id, level, message, details, state, previous_state,
         created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            entry.run_id,
            entry.file_id,
            entry.level.as_str(),
            entry.message,
            serde_json::to_string(&entry.details)?,
            entry.state.map(|s| s.as_str()),
            entry.previous_state.map(|s| s.as_str()),
            to_text(entry.created_at),
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

pub fn list_for_run(conn: &Connection, run_id: &str) -> Result<Vec<RunLogEntry>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT * FROM run_logs WHERE run_id = ?1 ORDER BY id ASC")?;
    let rows = stmt
        .query_map(params![run_id], RunLogEntry::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

pub fn list_for_file(conn: &Connection, file_id: &str) -> Result<Vec<RunLogEntry>, DatabaseError> {
    let mut stmt = conn.prepare("SELECT * FROM run_logs WHERE file_id = ?1 ORDER BY id ASC")?;
    let rows = stmt
        .query_map(params![file_id], RunLogEntry::from_row)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::Database;

    #[test]
    fn test_append_and_list() {
        let db = Database::open_in_memory().unwrap();
        db.with_conn(|conn| {
            append(
                conn,
                &RunLogEntry::new("f1", Some("r1"), LogLevel::Info, "parsing started")
                    .with_states(FileState::Uploaded, FileState::Parsing),
            )?;
            append(
                conn,
                &RunLogEntry::new("f1", Some("r1"), LogLevel::Warn, "3 malformed lines")
                    .with_details(serde_json::json!({ "rows": [4, 9, 12] })),
            )?;
            append(
                conn,
                &RunLogEntry::new("f1", None, LogLevel::Info, "cancelled before parsing"),
            )?;

            let run_logs = list_for_run(conn, "r1")?;
            assert_eq!(run_logs.len(), 2);
            assert_eq!(run_logs[0].state, Some(FileState::Parsing));
            assert_eq!(run_logs[0].previous_state, Some(FileState::Uploaded));
            assert_eq!(run_logs[1].details["rows"][1], 9);
            assert_eq!(list_for_file(conn, "f1")?.len(), 3);
            Ok::<_, DatabaseError>(())
        })
        .unwrap();
    }
}
