//! Applies lifecycle transitions to the store.
//!
//! Every mutation runs in one transaction: the compare-and-set on the file
//! row, the mirrored run update and the run log entry commit together or
//! not at all. Leases do not bump the file version.

use chrono::{DateTime, Duration, Utc};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::PipelineType;
use crate::db::dead_letter_repo::{self, DeadLetterRow, DeadLetterStatus};
use crate::db::fact_repo::{self, FactRecord};
use crate::db::file_repo::{self, FileRow, StateWrite};
use crate::db::run_log_repo::{self, LogLevel, RunLogEntry};
use crate::db::run_repo::{self, RunCounts, RunRow};
use crate::db::Database;

use super::{
    FailureKind, FileState, RetryAttempt, RetryConfig, RetryDecision, StateChange,
    TransitionError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// When set, validated files wait in `awaiting_approval`.
    pub require_approval: bool,
    /// Lease length. Leases not renewed within it are reclaimable.
    pub stale_processing_timeout_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            require_approval: false,
            stale_processing_timeout_secs: 600,
        }
    }
}

impl LifecycleConfig {
    pub fn lease_duration(&self) -> Duration {
        const MAX_SECS: u64 = 366 * 24 * 60 * 60;
        Duration::seconds(self.stale_processing_timeout_secs.min(MAX_SECS) as i64)
    }
}

/// A file handed over by the upload layer.
#[derive(Debug, Clone)]
pub struct NewUpload {
    pub organization_id: String,
    pub storage_location: String,
    pub checksum: String,
    pub size_bytes: i64,
    pub mime_type: Option<String>,
    pub pipeline_type: PipelineType,
    pub uploaded_by: String,
}

#[derive(Debug, Clone)]
pub struct Transition<'a> {
    pub to: FileState,
    pub expected_version: i64,
    pub actor: &'a str,
    pub message: Option<&'a str>,
}

impl<'a> Transition<'a> {
    pub fn new(to: FileState, expected_version: i64, actor: &'a str) -> Self {
        Self {
            to,
            expected_version,
            actor,
            message: None,
        }
    }

    pub fn with_message(mut self, message: &'a str) -> Self {
        self.message = Some(message);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Send the file back to `parsing` with a fresh retry budget.
    Retry,
    /// Close the entry. The file stays `failed` and is never retried.
    Discard,
}

#[derive(Debug, Clone)]
pub struct FailureOutcome {
    pub file: FileRow,
    pub decision: RetryDecision,
    pub dead_letter_id: Option<String>,
}

#[derive(Clone)]
pub struct StateController {
    db: Database,
    retry: RetryConfig,
    lifecycle: LifecycleConfig,
}

impl StateController {
    pub fn new(db: Database, retry: RetryConfig, lifecycle: LifecycleConfig) -> Self {
        Self {
            db,
            retry,
            lifecycle,
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn lifecycle(&self) -> &LifecycleConfig {
        &self.lifecycle
    }

    /// Registers a new file in `uploaded` with version 1.
    pub fn register_upload(&self, upload: NewUpload) -> Result<FileRow, TransitionError> {
        self.db.with_tx(|conn| {
            if let Some(existing) =
                file_repo::find_live_by_checksum(conn, &upload.organization_id, &upload.checksum)?
            {
                return Err(TransitionError::DuplicateUpload {
                    existing_id: existing.id,
                });
            }

            let now = Utc::now();
            let file = FileRow {
                id: Uuid::new_v4().to_string(),
                organization_id: upload.organization_id,
                storage_location: upload.storage_location,
                checksum: upload.checksum,
                size_bytes: upload.size_bytes,
                mime_type: upload.mime_type,
                pipeline_type: upload.pipeline_type,
                uploaded_by: upload.uploaded_by.clone(),
                current_state: FileState::Uploaded,
                state_history: vec![StateChange {
                    state: FileState::Uploaded,
                    timestamp: now,
                    actor: upload.uploaded_by,
                    message: None,
                }],
                error_message: None,
                version: 1,
                locked_by: None,
                locked_at: None,
                lock_expires_at: None,
                dead_lettered: false,
                created_at: now,
                updated_at: now,
            };
            file_repo::insert(conn, &file)?;

            let mut entry = RunLogEntry::new(&file.id, None, LogLevel::Info, "File uploaded")
                .with_details(serde_json::json!({
                    "pipeline_type": file.pipeline_type,
                    "size_bytes": file.size_bytes,
                }));
            entry.state = Some(FileState::Uploaded);
            run_log_repo::append(conn, &entry)?;

            log::info!("Registered upload {} ({})", file.id, file.pipeline_type);
            Ok(file)
        })
    }

    /// Applies one transition under optimistic locking.
    pub fn transition(
        &self,
        file_id: &str,
        transition: Transition<'_>,
    ) -> Result<FileRow, TransitionError> {
        self.db.with_tx(|conn| {
            let file = load_expected(conn, file_id, transition.expected_version)?;
            self.apply(conn, &file, &transition, Utc::now())
        })
    }

    pub fn approve(
        &self,
        file_id: &str,
        actor: &str,
        expected_version: i64,
    ) -> Result<FileRow, TransitionError> {
        self.transition(
            file_id,
            Transition::new(FileState::Approved, expected_version, actor),
        )
    }

    pub fn reject(
        &self,
        file_id: &str,
        actor: &str,
        expected_version: i64,
        reason: &str,
    ) -> Result<FileRow, TransitionError> {
        let file = self.get_file(file_id)?;
        if file.current_state != FileState::AwaitingApproval {
            return Err(TransitionError::InvalidTransition {
                from: file.current_state,
                to: FileState::Cancelled,
            });
        }
        self.transition(
            file_id,
            Transition::new(FileState::Cancelled, expected_version, actor).with_message(reason),
        )
    }

    pub fn load_approved(
        &self,
        file_id: &str,
        actor: &str,
        expected_version: i64,
    ) -> Result<FileRow, TransitionError> {
        let file = self.get_file(file_id)?;
        if file.current_state != FileState::Approved {
            return Err(TransitionError::InvalidTransition {
                from: file.current_state,
                to: FileState::Loading,
            });
        }
        self.transition(
            file_id,
            Transition::new(FileState::Loading, expected_version, actor),
        )
    }

    pub fn cancel(
        &self,
        file_id: &str,
        actor: &str,
        expected_version: i64,
    ) -> Result<FileRow, TransitionError> {
        self.transition(
            file_id,
            Transition::new(FileState::Cancelled, expected_version, actor),
        )
    }

    /// Takes the processing lease on a file for `owner`.
    pub fn acquire_lease(&self, file_id: &str, owner: &str) -> Result<FileRow, TransitionError> {
        self.db.with_tx(|conn| {
            let now = Utc::now();
            let expires_at = now + self.lifecycle.lease_duration();
            if !file_repo::try_acquire_lease(conn, file_id, owner, now, expires_at)? {
                return match file_repo::find_by_id(conn, file_id)? {
                    Some(file) => Err(TransitionError::LeaseHeld {
                        file_id: file_id.to_string(),
                        owner: file.locked_by.unwrap_or_default(),
                    }),
                    None => Err(not_found(file_id)),
                };
            }
            if let Some(run) = open_run(conn, file_id)? {
                run_repo::set_lease(conn, &run.id, Some(owner), Some(now), Some(expires_at))?;
            }
            file_repo::find_by_id(conn, file_id)?.ok_or_else(|| not_found(file_id))
        })
    }

    /// Extends the lease. Fails with `LeaseHeld` when `owner` lost it.
    pub fn renew_lease(&self, file_id: &str, owner: &str) -> Result<(), TransitionError> {
        self.db.with_tx(|conn| {
            let expires_at = Utc::now() + self.lifecycle.lease_duration();
            if !file_repo::renew_lease(conn, file_id, owner, expires_at)? {
                let file = file_repo::find_by_id(conn, file_id)?.ok_or_else(|| not_found(file_id))?;
                return Err(TransitionError::LeaseHeld {
                    file_id: file_id.to_string(),
                    owner: file.locked_by.unwrap_or_default(),
                });
            }
            if let Some(run) = open_run(conn, file_id)? {
                run_repo::set_lease(conn, &run.id, Some(owner), run.locked_at, Some(expires_at))?;
            }
            Ok(())
        })
    }

    pub fn release_lease(&self, file_id: &str, owner: &str) -> Result<bool, TransitionError> {
        self.db.with_tx(|conn| release(conn, file_id, owner))
    }

    /// Renews the lease and returns the file as currently stored, so a
    /// pipeline can notice a cancellation between batches.
    pub fn checkpoint(&self, file_id: &str, owner: &str) -> Result<FileRow, TransitionError> {
        self.renew_lease(file_id, owner)?;
        self.get_file(file_id)
    }

    /// Clears leases whose holder stopped renewing. Files still in a
    /// processing state are failed as transient so they get retried.
    /// Returns the reclaimed file ids.
    pub fn reclaim_stale_leases(&self, now: DateTime<Utc>) -> Result<Vec<String>, TransitionError> {
        let stale = self.db.with_conn(|conn| file_repo::list_stale_leases(conn, now))?;
        let mut reclaimed = Vec::with_capacity(stale.len());

        for file in stale {
            let owner = file.locked_by.clone().unwrap_or_default();
            log::warn!("Reclaiming stale lease on {} held by {}", file.id, owner);

            if file.current_state.is_processing() {
                let message = format!("Lease held by {} expired", owner);
                match self.record_failure(
                    &file.id,
                    file.version,
                    "lease-sweeper",
                    FailureKind::Transient,
                    &message,
                ) {
                    Ok(_) => {}
                    // Holder finished the transition first.
                    Err(TransitionError::VersionConflict { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }
            self.db
                .with_tx(|conn| release(conn, &file.id, &owner))?;
            reclaimed.push(file.id);
        }

        Ok(reclaimed)
    }

    /// Moves a processing file to `failed` and either schedules a retry or
    /// dead-letters it, releasing any lease.
    pub fn record_failure(
        &self,
        file_id: &str,
        expected_version: i64,
        actor: &str,
        kind: FailureKind,
        message: &str,
    ) -> Result<FailureOutcome, TransitionError> {
        self.db.with_tx(|conn| {
            let now = Utc::now();
            let file = load_expected(conn, file_id, expected_version)?;
            let run = open_run(conn, file_id)?;
            let failed = self.apply(
                conn,
                &file,
                &Transition::new(FileState::Failed, expected_version, actor).with_message(message),
                now,
            )?;

            let retries_so_far = run.as_ref().map(|r| r.retry_count).unwrap_or(0);
            let decision = self.retry.decide(kind, retries_so_far);
            let run_id = run.as_ref().map(|r| r.id.as_str());
            let mut dead_letter_id = None;

            match decision {
                RetryDecision::Retry { attempt, delay } => {
                    let delay = Duration::from_std(delay).unwrap_or_else(|_| Duration::zero());
                    let next_retry_at = now + delay;
                    if let Some(run_id) = run_id {
                        run_repo::record_error(conn, run_id, kind, message, Some(next_retry_at), now)?;
                    }
                    run_log_repo::append(
                        conn,
                        &RunLogEntry::new(
                            file_id,
                            run_id,
                            LogLevel::Warn,
                            format!(
                                "Retry {}/{} scheduled for {}",
                                attempt,
                                self.retry.max_retries,
                                next_retry_at.to_rfc3339()
                            ),
                        )
                        .with_details(serde_json::json!({
                            "failure_kind": kind,
                            "attempt": attempt,
                            "delay_ms": delay.num_milliseconds(),
                        })),
                    )?;
                    log::warn!(
                        "File {} failed ({}), retry {} in {}ms",
                        file_id,
                        kind,
                        attempt,
                        delay.num_milliseconds()
                    );
                }
                RetryDecision::DeadLetter {
                    max_retries_exceeded,
                } => {
                    if let Some(run_id) = run_id {
                        run_repo::record_error(conn, run_id, kind, message, None, now)?;
                    }
                    let id = Uuid::new_v4().to_string();
                    let entry = DeadLetterRow {
                        id: id.clone(),
                        file_id: file_id.to_string(),
                        run_id: run_id.map(str::to_string),
                        error_kind: kind,
                        error_message: message.to_string(),
                        max_retries_exceeded,
                        retry_history: retry_history(conn, file_id)?,
                        status: DeadLetterStatus::Pending,
                        resolved_by: None,
                        resolution_notes: None,
                        resolved_at: None,
                        created_at: now,
                        updated_at: now,
                    };
                    dead_letter_repo::insert(conn, &entry)?;
                    file_repo::set_dead_lettered(conn, file_id, true, now)?;
                    run_log_repo::append(
                        conn,
                        &RunLogEntry::new(file_id, run_id, LogLevel::Error, "Moved to dead letter queue")
                            .with_details(serde_json::json!({
                                "dead_letter_id": id,
                                "failure_kind": kind,
                                "max_retries_exceeded": max_retries_exceeded,
                            })),
                    )?;
                    log::error!(
                        "File {} dead-lettered ({}, retries exhausted: {})",
                        file_id,
                        kind,
                        max_retries_exceeded
                    );
                    dead_letter_id = Some(id);
                }
            }

            if let Some(owner) = failed.locked_by.as_deref() {
                release(conn, file_id, owner)?;
            }
            let file = file_repo::find_by_id(conn, file_id)?.ok_or_else(|| not_found(file_id))?;

            Ok(FailureOutcome {
                file,
                decision,
                dead_letter_id,
            })
        })
    }

    /// Failed files whose scheduled retry is due at `now`.
    pub fn due_retries(&self, now: DateTime<Utc>, limit: u32) -> Result<Vec<FileRow>, TransitionError> {
        Ok(self
            .db
            .with_conn(|conn| file_repo::list_due_for_retry(conn, now, limit))?)
    }

    pub fn resolve_dead_letter(
        &self,
        dead_letter_id: &str,
        resolver: &str,
        notes: Option<&str>,
        resolution: Resolution,
    ) -> Result<FileRow, TransitionError> {
        self.db.with_tx(|conn| {
            let now = Utc::now();
            let entry = dead_letter_repo::find_by_id(conn, dead_letter_id)?
                .filter(|e| e.status == DeadLetterStatus::Pending)
                .ok_or_else(|| TransitionError::DeadLetterClosed {
                    id: dead_letter_id.to_string(),
                })?;
            let file = file_repo::find_by_id(conn, &entry.file_id)?
                .ok_or_else(|| not_found(&entry.file_id))?;

            let status = match resolution {
                Resolution::Retry => DeadLetterStatus::Resolved,
                Resolution::Discard => DeadLetterStatus::Discarded,
            };
            dead_letter_repo::resolve(conn, dead_letter_id, status, resolver, notes, now)?;

            match resolution {
                Resolution::Retry => {
                    file_repo::set_dead_lettered(conn, &file.id, false, now)?;
                    let message = format!("Dead letter {} resolved for retry", dead_letter_id);
                    let file = file_repo::find_by_id(conn, &file.id)?
                        .ok_or_else(|| not_found(&entry.file_id))?;
                    self.apply(
                        conn,
                        &file,
                        &Transition::new(FileState::Parsing, file.version, resolver)
                            .with_message(&message),
                        now,
                    )
                }
                Resolution::Discard => {
                    run_log_repo::append(
                        conn,
                        &RunLogEntry::new(&file.id, entry.run_id.as_deref(), LogLevel::Info, "Dead letter discarded")
                            .with_details(serde_json::json!({
                                "dead_letter_id": dead_letter_id,
                                "resolved_by": resolver,
                                "notes": notes,
                            })),
                    )?;
                    log::info!("Dead letter {} discarded by {}", dead_letter_id, resolver);
                    Ok(file)
                }
            }
        })
    }

    pub fn update_run_counts(&self, run_id: &str, counts: RunCounts) -> Result<(), TransitionError> {
        Ok(self
            .db
            .with_conn(|conn| run_repo::update_counts(conn, run_id, counts, Utc::now()))?)
    }

    pub fn log(&self, entry: &RunLogEntry) -> Result<i64, TransitionError> {
        Ok(self.db.with_conn(|conn| run_log_repo::append(conn, entry))?)
    }

    pub fn get_file(&self, file_id: &str) -> Result<FileRow, TransitionError> {
        self.db
            .with_conn(|conn| file_repo::find_by_id(conn, file_id))?
            .ok_or_else(|| not_found(file_id))
    }

    pub fn files_in_state(&self, state: FileState, limit: u32) -> Result<Vec<FileRow>, TransitionError> {
        Ok(self
            .db
            .with_conn(|conn| file_repo::list_by_state(conn, state, limit))?)
    }

    /// The run opened by the most recent entry into `parsing`.
    pub fn current_run(&self, file_id: &str) -> Result<Option<RunRow>, TransitionError> {
        Ok(self.db.with_conn(|conn| run_repo::latest_for_file(conn, file_id))?)
    }

    pub fn runs_for_file(&self, file_id: &str) -> Result<Vec<RunRow>, TransitionError> {
        Ok(self.db.with_conn(|conn| run_repo::list_for_file(conn, file_id))?)
    }

    pub fn run_logs(&self, run_id: &str) -> Result<Vec<RunLogEntry>, TransitionError> {
        Ok(self.db.with_conn(|conn| run_log_repo::list_for_run(conn, run_id))?)
    }

    pub fn file_logs(&self, file_id: &str) -> Result<Vec<RunLogEntry>, TransitionError> {
        Ok(self.db.with_conn(|conn| run_log_repo::list_for_file(conn, file_id))?)
    }

    pub fn facts(
        &self,
        organization_id: &str,
        pipeline: Option<PipelineType>,
    ) -> Result<Vec<FactRecord>, TransitionError> {
        Ok(self
            .db
            .with_conn(|conn| fact_repo::list_by_organization(conn, organization_id, pipeline))?)
    }

    pub fn pending_dead_letters(&self) -> Result<Vec<DeadLetterRow>, TransitionError> {
        Ok(self
            .db
            .with_conn(|conn| dead_letter_repo::list_by_status(conn, DeadLetterStatus::Pending))?)
    }

    /// Checks and writes one transition inside an open transaction.
    fn apply(
        &self,
        conn: &Connection,
        file: &FileRow,
        transition: &Transition<'_>,
        now: DateTime<Utc>,
    ) -> Result<FileRow, TransitionError> {
        let from = file.current_state;
        let to = transition.to;

        if !from.can_transition_to(to) {
            return Err(TransitionError::InvalidTransition { from, to });
        }
        if from == FileState::Validated && to == FileState::Loading && self.lifecycle.require_approval {
            return Err(TransitionError::ApprovalRequired {
                file_id: file.id.clone(),
            });
        }

        let previous_run = run_repo::latest_for_file(conn, &file.id)?;
        if to == FileState::Parsing {
            if let Some(run) = previous_run.as_ref().filter(|r| !r.is_finished()) {
                return Err(TransitionError::InvalidTransition {
                    from: run.current_state,
                    to,
                });
            }
        }

        let change = StateChange {
            state: to,
            timestamp: now,
            actor: transition.actor.to_string(),
            message: transition.message.map(str::to_string),
        };
        let error_message = match to {
            FileState::Failed => transition.message,
            FileState::Parsing => None,
            _ => file.error_message.as_deref(),
        };
        let write = StateWrite {
            file_id: &file.id,
            expected_version: transition.expected_version,
            from,
            change: &change,
            error_message,
        };
        if !file_repo::compare_and_set_state(conn, &write)? {
            let actual = file_repo::find_by_id(conn, &file.id)?
                .map(|f| f.version)
                .unwrap_or(file.version);
            return Err(TransitionError::VersionConflict {
                file_id: file.id.clone(),
                expected: transition.expected_version,
                actual,
            });
        }

        let run_id = if to == FileState::Parsing {
            let run = new_run(file, previous_run.as_ref(), now);
            run_repo::insert(conn, &run)?;
            if let Some(owner) = file.locked_by.as_deref() {
                run_repo::set_lease(conn, &run.id, Some(owner), file.locked_at, file.lock_expires_at)?;
            }
            Some(run.id)
        } else {
            match previous_run.filter(|r| !r.is_finished()) {
                Some(run) => {
                    run_repo::update_state(conn, &run.id, to, now)?;
                    if to.ends_run() {
                        run_repo::set_lease(conn, &run.id, None, None, None)?;
                    }
                    Some(run.id)
                }
                None => None,
            }
        };

        let level = if to == FileState::Failed {
            LogLevel::Error
        } else {
            LogLevel::Info
        };
        let mut entry = RunLogEntry::new(
            &file.id,
            run_id.as_deref(),
            level,
            transition
                .message
                .map(str::to_string)
                .unwrap_or_else(|| format!("{} -> {}", from, to)),
        )
        .with_states(from, to)
        .with_details(serde_json::json!({ "actor": transition.actor }));
        entry.created_at = now;
        run_log_repo::append(conn, &entry)?;

        log::debug!("File {} {} -> {} by {}", file.id, from, to, transition.actor);

        file_repo::find_by_id(conn, &file.id)?.ok_or_else(|| not_found(&file.id))
    }
}

fn not_found(file_id: &str) -> TransitionError {
    TransitionError::NotFound {
        file_id: file_id.to_string(),
    }
}

fn load_expected(
    conn: &Connection,
    file_id: &str,
    expected_version: i64,
) -> Result<FileRow, TransitionError> {
    let file = file_repo::find_by_id(conn, file_id)?.ok_or_else(|| not_found(file_id))?;
    if file.version != expected_version {
        return Err(TransitionError::VersionConflict {
            file_id: file_id.to_string(),
            expected: expected_version,
            actual: file.version,
        });
    }
    Ok(file)
}

fn open_run(conn: &Connection, file_id: &str) -> Result<Option<RunRow>, TransitionError> {
    Ok(run_repo::latest_for_file(conn, file_id)?.filter(|r| !r.is_finished()))
}

fn release(conn: &Connection, file_id: &str, owner: &str) -> Result<bool, TransitionError> {
    let released = file_repo::release_lease(conn, file_id, owner)?;
    if released {
        if let Some(run) = run_repo::latest_for_file(conn, file_id)? {
            run_repo::set_lease(conn, &run.id, None, None, None)?;
        }
    }
    Ok(released)
}

/// Run n+1. A run that follows a scheduled retry inherits its retry count
/// plus one; any other re-entry starts a fresh budget.
fn new_run(file: &FileRow, previous: Option<&RunRow>, now: DateTime<Utc>) -> RunRow {
    let run_number = previous.map(|r| r.run_number + 1).unwrap_or(1);
    let retry_count = match previous {
        Some(prev) if prev.next_retry_at.is_some() => prev.retry_count + 1,
        _ => 0,
    };
    RunRow {
        id: Uuid::new_v4().to_string(),
        file_id: file.id.clone(),
        run_number,
        current_state: FileState::Parsing,
        records_total: 0,
        records_processed: 0,
        records_failed: 0,
        retry_count,
        next_retry_at: None,
        version: 1,
        locked_by: None,
        locked_at: None,
        lock_expires_at: None,
        last_error_kind: None,
        last_error_message: None,
        started_at: now,
        finished_at: None,
        created_at: now,
        updated_at: now,
    }
}

fn retry_history(conn: &Connection, file_id: &str) -> Result<Vec<RetryAttempt>, TransitionError> {
    Ok(run_repo::list_for_file(conn, file_id)?
        .into_iter()
        .filter(|run| run.last_error_kind.is_some())
        .map(|run| RetryAttempt {
            run_id: run.id,
            run_number: run.run_number,
            retry_count: run.retry_count,
            kind: run.last_error_kind,
            message: run.last_error_message,
            failed_at: run.finished_at.unwrap_or(run.updated_at),
            next_retry_at: run.next_retry_at,
        })
        .collect())
}
