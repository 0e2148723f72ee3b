use std::io::Cursor;
use std::ops::ControlFlow;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tokio::io::AsyncReadExt;
use tracing::{info_span, Instrument};

use crate::batch::{BatchProcessor, BatchResult, FactSink, StagingError, StagingSink, ValidationSink};
use crate::cleanse::Cleanser;
use crate::db::fact_repo::NewFact;
use crate::db::file_repo::FileRow;
use crate::db::run_log_repo::{LogLevel, RunLogEntry};
use crate::db::staging_repo::{self, NewStagingRow, StagingRow, ValidationUpdate};
use crate::db::{Database, DatabaseError};
use crate::mapping::{HeaderMapper, MappingError};
use crate::parsing::{detect_separator, parse_stream, read_sample, ParsedRow, RowHandler};
use crate::state::{FailureKind, FileState, RetryDecision, StateController, Transition, TransitionError};
use crate::validate::{
    BusinessValidator, IssueCode, ProcessedRecord, ValidationIssue, ValidationStatus,
};

use super::config::PipelineConfig;
use super::context::{IngestReport, RunContext};
use super::error::PipelineError;
use super::progress::{ProgressEvent, ProgressReporter};
use super::source::SourceProvider;

/// Malformed lines copied into the run log. The rest are only counted.
const LOGGED_PARSE_ERRORS: usize = 50;

#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    /// Stopped in `awaiting_approval`, or reached `loaded`.
    Finished {
        state: FileState,
        report: IngestReport,
    },
    Failed {
        kind: FailureKind,
        decision: RetryDecision,
        message: String,
    },
    Cancelled,
    /// Another worker or actor moved the file first.
    Superseded,
}

pub struct Pipeline {
    controller: StateController,
    config: Arc<PipelineConfig>,
    source: Arc<dyn SourceProvider>,
}

impl Pipeline {
    pub fn new(
        controller: StateController,
        config: Arc<PipelineConfig>,
        source: Arc<dyn SourceProvider>,
    ) -> Self {
        Self {
            controller,
            config,
            source,
        }
    }

    pub fn controller(&self) -> &StateController {
        &self.controller
    }

    fn db(&self) -> &Database {
        self.controller.database()
    }

    /// Parses, validates and (unless approval is required) loads one file.
    ///
    /// Accepts files in `uploaded`, `cancelled`, `parsing` files whose lease
    /// is free, and non-dead-lettered `failed` files whose retry is due.
    /// Anything else, or a lease held by another worker, yields
    /// [`IngestOutcome::Superseded`].
    pub async fn ingest(
        &self,
        file_id: &str,
        owner: &str,
        progress: &dyn ProgressReporter,
    ) -> Result<IngestOutcome, PipelineError> {
        let Some(mut ctx) = self.claim_for_parsing(file_id, owner)? else {
            return Ok(IngestOutcome::Superseded);
        };

        let span = info_span!("pipeline",
            file_id = %file_id,
            run_id = %ctx.run_id,
            pipeline = %ctx.batch.pipeline_type,
        );
        let result = self.run_from_parsing(&mut ctx, progress).instrument(span).await;
        self.settle(&ctx, result, progress)
    }

    /// Loads an `approved` file.
    pub async fn load(
        &self,
        file_id: &str,
        owner: &str,
        progress: &dyn ProgressReporter,
    ) -> Result<IngestOutcome, PipelineError> {
        let Some(mut ctx) = self.claim_for_loading(file_id, owner)? else {
            return Ok(IngestOutcome::Superseded);
        };

        let span = info_span!("pipeline",
            file_id = %file_id,
            run_id = %ctx.run_id,
            pipeline = %ctx.batch.pipeline_type,
        );
        let result = self.run_load(&mut ctx, progress).instrument(span).await;
        self.settle(&ctx, result, progress)
    }

    fn claim_for_parsing(
        &self,
        file_id: &str,
        owner: &str,
    ) -> Result<Option<RunContext>, PipelineError> {
        let file = self.controller.get_file(file_id)?;
        let startable = match file.current_state {
            FileState::Uploaded | FileState::Cancelled | FileState::Parsing => true,
            FileState::Failed => !file.dead_lettered && self.retry_due(file_id)?,
            _ => false,
        };
        if !startable {
            log::debug!("File {} is {}, nothing to ingest", file_id, file.current_state);
            return Ok(None);
        }

        let Some(leased) = self.lease(file_id, owner)? else {
            return Ok(None);
        };
        let file = if leased.current_state == FileState::Parsing {
            leased
        } else {
            let transition = Transition::new(FileState::Parsing, leased.version, owner);
            match self.controller.transition(file_id, transition) {
                Ok(file) => file,
                Err(e) => return self.abandon_claim(file_id, owner, e),
            }
        };

        let run = self.open_run(file_id)?;
        Ok(Some(RunContext::new(file, run, owner)))
    }

    fn claim_for_loading(
        &self,
        file_id: &str,
        owner: &str,
    ) -> Result<Option<RunContext>, PipelineError> {
        let file = self.controller.get_file(file_id)?;
        if file.current_state != FileState::Approved {
            log::debug!("File {} is {}, nothing to load", file_id, file.current_state);
            return Ok(None);
        }

        let Some(leased) = self.lease(file_id, owner)? else {
            return Ok(None);
        };
        let file = match self.controller.load_approved(file_id, owner, leased.version) {
            Ok(file) => file,
            Err(e) => return self.abandon_claim(file_id, owner, e),
        };

        let run_id = self.open_run(file_id)?;
        let mut ctx = RunContext::new(file, run_id, owner);
        if let Some(run) = self.controller.current_run(file_id)? {
            ctx.counts.total = run.records_total;
            ctx.counts.processed = run.records_processed;
            ctx.counts.failed = run.records_failed;
        }
        Ok(Some(ctx))
    }

    /// A failed file waits for its scheduled retry. Failures with no
    /// schedule, such as reclaimed leases, may start at once.
    fn retry_due(&self, file_id: &str) -> Result<bool, PipelineError> {
        let next = self
            .controller
            .current_run(file_id)?
            .and_then(|run| run.next_retry_at);
        match next {
            Some(at) if at > Utc::now() => {
                log::debug!("File {} retries at {}", file_id, at);
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    fn lease(
        &self,
        file_id: &str,
        owner: &str,
    ) -> Result<Option<FileRow>, PipelineError> {
        match self.controller.acquire_lease(file_id, owner) {
            Ok(file) => Ok(Some(file)),
            Err(TransitionError::LeaseHeld { owner: holder, .. }) => {
                log::debug!("File {} is leased by {}", file_id, holder);
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn abandon_claim(
        &self,
        file_id: &str,
        owner: &str,
        error: TransitionError,
    ) -> Result<Option<RunContext>, PipelineError> {
        if let Err(e) = self.controller.release_lease(file_id, owner) {
            log::warn!("Failed to release lease on {}: {}", file_id, e);
        }
        let error = PipelineError::from(error);
        if error.is_superseded() {
            log::debug!("Lost the race for {}: {}", file_id, error);
            Ok(None)
        } else {
            Err(error)
        }
    }

    fn open_run(&self, file_id: &str) -> Result<String, PipelineError> {
        let run = self
            .controller
            .current_run(file_id)?
            .filter(|run| !run.is_finished())
            .ok_or_else(|| DatabaseError::Corrupt {
                message: format!("file {} has no open run", file_id),
            })?;
        Ok(run.id)
    }

    async fn run_from_parsing(
        &self,
        ctx: &mut RunContext,
        progress: &dyn ProgressReporter,
    ) -> Result<IngestOutcome, PipelineError> {
        self.parse(ctx, progress)
            .instrument(info_span!("parse"))
            .await?;
        self.validate(ctx, progress)
            .instrument(info_span!("validate"))
            .await?;

        if self.controller.lifecycle().require_approval {
            self.advance(ctx, FileState::AwaitingApproval)?;
            self.controller.release_lease(ctx.file_id(), &ctx.owner)?;
            progress.report(ProgressEvent::Completed {
                state: FileState::AwaitingApproval,
            });
            log::info!(
                "File {} validated, {} rows await approval",
                ctx.file_id(),
                ctx.counts.processed
            );
            return Ok(IngestOutcome::Finished {
                state: FileState::AwaitingApproval,
                report: ctx.report(),
            });
        }

        self.advance(ctx, FileState::Loading)?;
        self.run_load(ctx, progress).await
    }

    async fn run_load(
        &self,
        ctx: &mut RunContext,
        progress: &dyn ProgressReporter,
    ) -> Result<IngestOutcome, PipelineError> {
        self.load_facts(ctx, progress)
            .instrument(info_span!("load"))
            .await?;
        self.advance(ctx, FileState::Loaded)?;
        self.controller.release_lease(ctx.file_id(), &ctx.owner)?;

        progress.report(ProgressEvent::Completed {
            state: FileState::Loaded,
        });
        log::info!(
            "File {} loaded: {} facts inserted, {} updated",
            ctx.file_id(),
            ctx.facts_inserted,
            ctx.facts_updated
        );
        Ok(IngestOutcome::Finished {
            state: FileState::Loaded,
            report: ctx.report(),
        })
    }

    async fn parse(
        &self,
        ctx: &mut RunContext,
        progress: &dyn ProgressReporter,
    ) -> Result<(), PipelineError> {
        progress.report(ProgressEvent::Stage {
            state: FileState::Parsing,
            message: "Detecting separator".to_string(),
        });

        let location = ctx.file.storage_location.clone();
        let mut reader = self.source.open(&location).await?;
        let sample = read_sample(&mut reader, self.config.sample_bytes)
            .await
            .map_err(|e| PipelineError::Source {
                location: location.clone(),
                source: e,
            })?;

        let detection = detect_separator(&String::from_utf8_lossy(&sample), &self.config.detection);
        self.log(
            ctx,
            LogLevel::Info,
            "Separator detected",
            json!({
                "separator": detection.separator.to_string(),
                "quote": detection.quote.to_string(),
                "confidence": detection.confidence,
            }),
        )?;

        let options = self
            .config
            .parsing
            .clone()
            .with_separator(detection.separator_byte())
            .with_quote(detection.quote_byte());
        let mapper = HeaderMapper::new(
            ctx.batch.pipeline_type.dictionary(),
            self.config.mapping.case_sensitive,
        )
        .with_suggestion_distance(self.config.mapping.suggestion_distance);

        let mut handler = StagingHandler {
            pipeline: self,
            ctx: &mut *ctx,
            progress,
            mapper,
            headers: Vec::new(),
            processor: BatchProcessor::new(StagingSink::new(self.db().clone()), self.config.batch.clone()),
            staged: 0,
            error: None,
        };
        let summary = parse_stream(Cursor::new(sample).chain(reader), &options, &mut handler).await?;
        let StagingHandler { error, .. } = handler;
        if let Some(e) = error {
            return Err(e);
        }
        if summary.headers.is_empty() {
            return Err(MappingError::NoHeaders.into());
        }

        let malformed = summary.errors.len() as u64;
        let staged = self
            .db()
            .with_conn(|conn| staging_repo::count_by_status(conn, &ctx.run_id))?;
        ctx.counts.total = summary.total_rows + malformed;
        ctx.counts.failed = ctx.counts.total.saturating_sub(staged.pending);
        self.controller.update_run_counts(&ctx.run_id, ctx.counts)?;

        if !summary.errors.is_empty() {
            let logged: Vec<_> = summary.errors.iter().take(LOGGED_PARSE_ERRORS).collect();
            self.log(
                ctx,
                LogLevel::Warn,
                &format!("Skipped {} malformed lines", summary.errors.len()),
                json!({ "errors": logged }),
            )?;
        }
        ctx.parse_errors = summary.errors;

        self.advance(ctx, FileState::Parsed)?;
        progress.report(ProgressEvent::Stage {
            state: FileState::Parsed,
            message: format!("Staged {} rows", summary.total_rows),
        });
        log::info!(
            "File {}: staged {} rows ({} malformed lines skipped)",
            ctx.file_id(),
            summary.total_rows,
            malformed
        );
        Ok(())
    }

    async fn validate(
        &self,
        ctx: &mut RunContext,
        progress: &dyn ProgressReporter,
    ) -> Result<(), PipelineError> {
        self.advance(ctx, FileState::Validating)?;
        progress.report(ProgressEvent::Stage {
            state: FileState::Validating,
            message: "Cleansing and validating rows".to_string(),
        });

        let pipeline_type = ctx.batch.pipeline_type;
        let validator = BusinessValidator::new(pipeline_type, &self.config.validation)?;
        let cleanser = Cleanser::new(pipeline_type, Arc::clone(&self.config.aliases));
        let processor = BatchProcessor::new(
            ValidationSink::new(self.db().clone()),
            self.config.batch.clone(),
        );

        let mut after_id = 0;
        let mut validated = 0u64;
        loop {
            let page = self.db().with_conn(|conn| {
                staging_repo::page_by_status(
                    conn,
                    &ctx.run_id,
                    ValidationStatus::Pending,
                    after_id,
                    self.config.page_size(),
                )
            })?;
            let Some(last) = page.last() else {
                break;
            };
            after_id = last.id;

            let updates = validate_page(
                &cleanser,
                &validator,
                &ctx.batch.organization_id,
                &page,
                self.config.validation_threads,
            );
            let result = processor.write(&ctx.batch, updates).await;
            self.log_chunk_failures(ctx, "Validation", &result)?;

            validated += page.len() as u64;
            self.checkpoint(ctx)?;
            progress.report(ProgressEvent::Rows {
                state: FileState::Validating,
                processed: validated,
            });
        }

        let counts = self
            .db()
            .with_conn(|conn| staging_repo::count_by_status(conn, &ctx.run_id))?;
        // Rows still pending lost their validation chunk.
        ctx.counts.processed = counts.loadable();
        ctx.counts.failed = ctx.counts.total.saturating_sub(counts.loadable());
        self.controller.update_run_counts(&ctx.run_id, ctx.counts)?;
        self.log(
            ctx,
            LogLevel::Info,
            "Validation finished",
            json!({
                "valid": counts.valid,
                "warning": counts.warning,
                "invalid": counts.invalid,
                "unvalidated": counts.pending,
            }),
        )?;

        if counts.loadable() == 0 {
            log::warn!(
                "File {}: none of {} rows can be loaded",
                ctx.file_id(),
                ctx.counts.total
            );
            self.log(
                ctx,
                LogLevel::Warn,
                "No loadable rows",
                json!({ "total": ctx.counts.total, "failed": ctx.counts.failed }),
            )?;
        }

        self.advance(ctx, FileState::Validated)?;
        Ok(())
    }

    async fn load_facts(
        &self,
        ctx: &mut RunContext,
        progress: &dyn ProgressReporter,
    ) -> Result<(), PipelineError> {
        progress.report(ProgressEvent::Stage {
            state: FileState::Loading,
            message: "Upserting facts".to_string(),
        });

        let processor = BatchProcessor::new(FactSink::new(self.db().clone()), self.config.batch.clone());
        let mut after_id = 0;
        let mut loaded = 0u64;
        let mut rejected = 0u64;
        loop {
            let page = self.db().with_conn(|conn| {
                staging_repo::page_loadable(conn, &ctx.run_id, after_id, self.config.page_size())
            })?;
            let Some(last) = page.last() else {
                break;
            };
            after_id = last.id;

            let result = processor.process(&ctx.batch, page, fact_from_row).await;
            self.log_chunk_failures(ctx, "Fact", &result)?;
            for error in &result.errors {
                log::warn!("File {}: {}", ctx.file_id(), error);
            }

            ctx.facts_inserted += result.inserted_count;
            ctx.facts_updated += result.updated_count;
            loaded += (result.inserted_count + result.updated_count) as u64;
            rejected += result.failed_count as u64;
            self.checkpoint(ctx)?;
            progress.report(ProgressEvent::Rows {
                state: FileState::Loading,
                processed: loaded,
            });
        }

        ctx.counts.processed = loaded;
        ctx.counts.failed += rejected;
        self.controller.update_run_counts(&ctx.run_id, ctx.counts)?;
        self.log(
            ctx,
            LogLevel::Info,
            "Facts loaded",
            json!({
                "inserted": ctx.facts_inserted,
                "updated": ctx.facts_updated,
                "rejected": rejected,
            }),
        )?;
        Ok(())
    }

    fn advance(&self, ctx: &mut RunContext, to: FileState) -> Result<(), PipelineError> {
        let file = self.controller.transition(
            ctx.file_id(),
            Transition::new(to, ctx.version(), &ctx.owner),
        )?;
        ctx.advance(file);
        Ok(())
    }

    /// Renews the lease and stops the run if the file moved underneath it.
    fn checkpoint(&self, ctx: &RunContext) -> Result<(), PipelineError> {
        let file = self.controller.checkpoint(ctx.file_id(), &ctx.owner)?;
        if file.version != ctx.version() {
            return Err(TransitionError::VersionConflict {
                file_id: file.id,
                expected: ctx.version(),
                actual: file.version,
            }
            .into());
        }
        Ok(())
    }

    /// Records chunks the processor gave up on. Their rows count as failed
    /// and the run carries on with the remaining chunks.
    fn log_chunk_failures(
        &self,
        ctx: &RunContext,
        stage: &str,
        result: &BatchResult,
    ) -> Result<(), PipelineError> {
        if !result.has_chunk_failures() {
            return Ok(());
        }
        let chunks: Vec<&StagingError> = result
            .errors
            .iter()
            .filter(|e| matches!(e, StagingError::Chunk { .. }))
            .collect();
        self.log(
            ctx,
            LogLevel::Warn,
            &format!("{} writes failed for {} chunks", stage, chunks.len()),
            json!({ "failed_rows": result.failed_count, "errors": chunks }),
        )
    }

    fn log(
        &self,
        ctx: &RunContext,
        level: LogLevel,
        message: &str,
        details: serde_json::Value,
    ) -> Result<(), PipelineError> {
        let mut entry =
            RunLogEntry::new(ctx.file_id(), Some(&ctx.run_id), level, message).with_details(details);
        entry.state = Some(ctx.state());
        self.controller.log(&entry)?;
        Ok(())
    }

    /// Turns a stage error into a recorded failure, or stands down when
    /// another actor got there first.
    fn settle(
        &self,
        ctx: &RunContext,
        result: Result<IngestOutcome, PipelineError>,
        progress: &dyn ProgressReporter,
    ) -> Result<IngestOutcome, PipelineError> {
        let error = match result {
            Ok(outcome) => return Ok(outcome),
            Err(e) => e,
        };
        if error.is_superseded() {
            return self.stand_down(ctx, &error);
        }

        let kind = error.failure_kind();
        let message = error.to_string();
        progress.report(ProgressEvent::Failed {
            error: message.clone(),
        });

        if !ctx.state().can_transition_to(FileState::Failed) {
            log::error!(
                "File {} hit an error in {} and cannot be failed: {}",
                ctx.file_id(),
                ctx.state(),
                message
            );
            self.release(ctx);
            return Err(error);
        }

        match self
            .controller
            .record_failure(ctx.file_id(), ctx.version(), &ctx.owner, kind, &message)
        {
            Ok(outcome) => Ok(IngestOutcome::Failed {
                kind,
                decision: outcome.decision,
                message,
            }),
            Err(e @ TransitionError::VersionConflict { .. }) => {
                self.stand_down(ctx, &PipelineError::from(e))
            }
            Err(e) => {
                self.release(ctx);
                Err(e.into())
            }
        }
    }

    fn stand_down(
        &self,
        ctx: &RunContext,
        cause: &PipelineError,
    ) -> Result<IngestOutcome, PipelineError> {
        self.release(ctx);
        let file = self.controller.get_file(ctx.file_id())?;
        if file.current_state == FileState::Cancelled {
            log::info!("File {} was cancelled, stopping", ctx.file_id());
            Ok(IngestOutcome::Cancelled)
        } else {
            log::warn!("Stopping work on {}: {}", ctx.file_id(), cause);
            Ok(IngestOutcome::Superseded)
        }
    }

    fn release(&self, ctx: &RunContext) {
        if let Err(e) = self.controller.release_lease(ctx.file_id(), &ctx.owner) {
            log::warn!("Failed to release lease on {}: {}", ctx.file_id(), e);
        }
    }
}

/// Maps parsed rows and appends them to staging as the parser streams.
struct StagingHandler<'a> {
    pipeline: &'a Pipeline,
    ctx: &'a mut RunContext,
    progress: &'a dyn ProgressReporter,
    mapper: HeaderMapper,
    headers: Vec<String>,
    processor: BatchProcessor<StagingSink>,
    staged: u64,
    error: Option<PipelineError>,
}

impl<'a> StagingHandler<'a> {
    fn map_headers(&mut self, headers: &[String]) -> Result<(), PipelineError> {
        let analysis = self.mapper.analyze_headers(headers).clone();
        log::info!(
            "File {}: mapped {} of {} headers (confidence {:.2})",
            self.ctx.file_id(),
            analysis.mapped.len(),
            headers.len(),
            analysis.confidence
        );
        let details = serde_json::to_value(&analysis).map_err(DatabaseError::from)?;
        self.pipeline
            .log(&*self.ctx, LogLevel::Info, "Headers mapped", details)?;
        analysis.ensure_complete()?;
        self.headers = headers.to_vec();
        Ok(())
    }

    async fn stage_batch(&mut self, rows: Vec<ParsedRow>) -> Result<(), PipelineError> {
        let mapper = &self.mapper;
        let headers = &self.headers;
        let batch = &self.ctx.batch;

        let result = self
            .processor
            .process(batch, rows, |row| {
                let mapped = mapper
                    .map_row(&row.raw, headers, row.row_number)
                    .map_err(|e| StagingError::Row {
                        row_number: row.row_number,
                        message: e.to_string(),
                    })?;
                let errors: Vec<ValidationIssue> = mapped
                    .errors
                    .iter()
                    .map(|e| {
                        ValidationIssue::error(
                            &e.field,
                            IssueCode::InvalidType,
                            format!("'{}': {}", e.value, e.message),
                        )
                    })
                    .collect();
                let status = if errors.is_empty() {
                    ValidationStatus::Pending
                } else {
                    ValidationStatus::Invalid
                };
                Ok(NewStagingRow {
                    organization_id: batch.organization_id.clone(),
                    file_id: batch.file_id.clone(),
                    run_id: batch.run_id.clone(),
                    row_number: row.row_number,
                    pipeline_type: batch.pipeline_type,
                    raw_values: row.raw,
                    mapped_values: Some(mapped.values),
                    validation_status: status,
                    validation_errors: errors,
                })
            })
            .await;

        self.pipeline
            .log_chunk_failures(&*self.ctx, "Staging", &result)?;
        self.staged += result.inserted_count as u64;

        self.pipeline.checkpoint(&*self.ctx)?;
        self.progress.report(ProgressEvent::Rows {
            state: FileState::Parsing,
            processed: self.staged,
        });
        Ok(())
    }
}

#[async_trait]
impl<'a> RowHandler for StagingHandler<'a> {
    async fn on_headers(&mut self, headers: &[String]) -> ControlFlow<()> {
        match self.map_headers(headers) {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => {
                self.error = Some(e);
                ControlFlow::Break(())
            }
        }
    }

    async fn on_batch(&mut self, rows: Vec<ParsedRow>) -> ControlFlow<()> {
        match self.stage_batch(rows).await {
            Ok(()) => ControlFlow::Continue(()),
            Err(e) => {
                self.error = Some(e);
                ControlFlow::Break(())
            }
        }
    }
}

/// Validates one page, splitting it across scoped threads.
fn validate_page(
    cleanser: &Cleanser,
    validator: &BusinessValidator,
    organization_id: &str,
    rows: &[StagingRow],
    threads: usize,
) -> Vec<ValidationUpdate> {
    let threads = threads.clamp(1, rows.len().max(1));
    if threads == 1 {
        return rows
            .iter()
            .map(|row| validate_row(cleanser, validator, organization_id, row))
            .collect();
    }

    let chunk_size = rows.len().div_ceil(threads);
    std::thread::scope(|scope| {
        let handles: Vec<_> = rows
            .chunks(chunk_size)
            .map(|chunk| {
                scope.spawn(move || {
                    chunk
                        .iter()
                        .map(|row| validate_row(cleanser, validator, organization_id, row))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| {
                handle
                    .join()
                    .unwrap_or_else(|panic| std::panic::resume_unwind(panic))
            })
            .collect()
    })
}

fn validate_row(
    cleanser: &Cleanser,
    validator: &BusinessValidator,
    organization_id: &str,
    row: &StagingRow,
) -> ValidationUpdate {
    let mapped = row.mapped_values.clone().unwrap_or_default();
    let cleansed = cleanser.cleanse(&mapped);
    let outcome = validator.validate(&cleansed.cleaned, &cleansed.warnings, organization_id);

    let mut status = outcome.status;
    let mut errors: Vec<ValidationIssue> = outcome.errors().into_iter().cloned().collect();
    let warnings: Vec<ValidationIssue> = outcome.warnings().into_iter().cloned().collect();
    let natural_key = outcome.natural_key().map(str::to_string);
    let payload = match outcome.processed.as_ref().map(serde_json::to_value).transpose() {
        Ok(payload) => payload,
        Err(e) => {
            errors.push(ValidationIssue::error(
                "payload",
                IssueCode::InvalidFormat,
                e.to_string(),
            ));
            status = ValidationStatus::Invalid;
            None
        }
    };

    ValidationUpdate {
        id: row.id,
        status,
        cleaned_values: Some(cleansed.cleaned),
        natural_key,
        errors,
        warnings,
        payload,
    }
}

fn fact_from_row(row: StagingRow) -> Result<NewFact, StagingError> {
    let row_number = row.row_number;
    let payload = row.payload.ok_or_else(|| StagingError::Row {
        row_number,
        message: "row has no processed payload".to_string(),
    })?;
    let processed: ProcessedRecord =
        serde_json::from_value(payload.clone()).map_err(|e| StagingError::Row {
            row_number,
            message: format!("payload does not decode: {}", e),
        })?;

    Ok(NewFact {
        organization_id: row.organization_id,
        natural_key: row
            .natural_key
            .unwrap_or_else(|| processed.natural_key.clone()),
        pipeline_type: row.pipeline_type,
        event_date: processed.typed.date,
        event_at: processed.event_at,
        shift: processed.canonical_shift.map(|s| s.as_str().to_string()),
        quantity_kg: processed.typed.quantity_kg,
        payload,
        file_id: row.file_id,
        run_id: row.run_id,
        row_number,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PipelineType;
    use crate::db::dead_letter_repo::DeadLetterStatus;
    use crate::pipeline::progress::NoopProgress;
    use crate::pipeline::source::MemorySourceProvider;
    use crate::state::{LifecycleConfig, NewUpload, RetryConfig};
    use std::sync::Mutex;

    const ORG: &str = "5b1e0f3a-0000-4000-8000-000000000001";

    const DISTRIBUTION_CSV: &str = "\
Data;Hora;Turno;Vagão;Curral;Dieta;Previsto (kg);Realizado;Operador
15/01/2024;06:30;Manhã;Bahman;C-12;Terminação;1.200,00;1.250,50;JOÃO DA SILVA
15/01/2024;07:10;manha;BAHMAN;C13;TERMINACAO;800;790;Maria
";

    struct Fixture {
        pipeline: Pipeline,
        source: Arc<MemorySourceProvider>,
    }

    fn fixture(lifecycle: LifecycleConfig) -> Fixture {
        fixture_with(lifecycle, PipelineConfig::default())
    }

    fn fixture_with(lifecycle: LifecycleConfig, config: PipelineConfig) -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let controller = StateController::new(db, RetryConfig::default(), lifecycle);
        let source = Arc::new(MemorySourceProvider::new());
        let pipeline = Pipeline::new(controller, Arc::new(config), source.clone());
        Fixture { pipeline, source }
    }

    fn upload(fx: &Fixture, location: &str, checksum: &str, content: &str) -> String {
        fx.source.insert(location, content);
        fx.pipeline
            .controller()
            .register_upload(NewUpload {
                organization_id: ORG.to_string(),
                storage_location: location.to_string(),
                checksum: checksum.to_string(),
                size_bytes: content.len() as i64,
                mime_type: Some("text/csv".to_string()),
                pipeline_type: PipelineType::Distribution,
                uploaded_by: "operator@farm".to_string(),
            })
            .unwrap()
            .id
    }

    #[tokio::test]
    async fn test_ingest_loads_facts() {
        let fx = fixture(LifecycleConfig::default());
        let file_id = upload(&fx, "a.csv", "sha-a", DISTRIBUTION_CSV);

        let outcome = fx.pipeline.ingest(&file_id, "worker-1", &NoopProgress).await.unwrap();

        match outcome {
            IngestOutcome::Finished { state, report } => {
                assert_eq!(state, FileState::Loaded);
                assert_eq!(report.rows_total, 2);
                assert_eq!(report.facts_inserted, 2);
                assert_eq!(report.rows_failed, 0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let controller = fx.pipeline.controller();
        let file = controller.get_file(&file_id).unwrap();
        assert_eq!(file.current_state, FileState::Loaded);
        assert!(file.locked_by.is_none());

        let facts = controller.facts(ORG, None).unwrap();
        assert_eq!(facts.len(), 2);
        let first = facts
            .iter()
            .find(|f| f.natural_key.contains("_C12_"))
            .unwrap();
        assert_eq!(first.quantity_kg, 1250.5);
        assert_eq!(first.event_date.to_string(), "2024-01-15");
        assert_eq!(first.shift.as_deref(), Some("MANHÃ"));
    }

    #[tokio::test]
    async fn test_reingesting_same_rows_updates_facts() {
        let fx = fixture(LifecycleConfig::default());
        let first = upload(&fx, "a.csv", "sha-a", DISTRIBUTION_CSV);
        let second = upload(&fx, "b.csv", "sha-b", DISTRIBUTION_CSV);

        fx.pipeline.ingest(&first, "worker-1", &NoopProgress).await.unwrap();
        let outcome = fx.pipeline.ingest(&second, "worker-1", &NoopProgress).await.unwrap();

        match outcome {
            IngestOutcome::Finished { report, .. } => {
                assert_eq!(report.facts_inserted, 0);
                assert_eq!(report.facts_updated, 2);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        let facts = fx.pipeline.controller().facts(ORG, None).unwrap();
        assert_eq!(facts.len(), 2);
        assert!(facts.iter().all(|f| f.load_count == 2));
    }

    #[tokio::test]
    async fn test_approval_gate_then_load() {
        let fx = fixture(LifecycleConfig {
            require_approval: true,
            ..LifecycleConfig::default()
        });
        let file_id = upload(&fx, "a.csv", "sha-a", DISTRIBUTION_CSV);

        let outcome = fx.pipeline.ingest(&file_id, "worker-1", &NoopProgress).await.unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Finished {
                state: FileState::AwaitingApproval,
                ..
            }
        ));
        let controller = fx.pipeline.controller();
        assert!(controller.facts(ORG, None).unwrap().is_empty());

        let file = controller.get_file(&file_id).unwrap();
        controller.approve(&file_id, "supervisor", file.version).unwrap();

        let outcome = fx.pipeline.load(&file_id, "worker-2", &NoopProgress).await.unwrap();
        match outcome {
            IngestOutcome::Finished { state, report } => {
                assert_eq!(state, FileState::Loaded);
                assert_eq!(report.facts_inserted, 2);
                assert_eq!(report.rows_total, 2);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_required_column_dead_letters() {
        let fx = fixture(LifecycleConfig::default());
        let file_id = upload(&fx, "a.csv", "sha-a", "Data;Turno\n15/01/2024;Manhã\n");

        let outcome = fx.pipeline.ingest(&file_id, "worker-1", &NoopProgress).await.unwrap();

        match outcome {
            IngestOutcome::Failed { kind, decision, message } => {
                assert_eq!(kind, FailureKind::Permanent);
                assert_eq!(
                    decision,
                    RetryDecision::DeadLetter {
                        max_retries_exceeded: false
                    }
                );
                assert!(message.contains("equipment"));
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let controller = fx.pipeline.controller();
        let file = controller.get_file(&file_id).unwrap();
        assert_eq!(file.current_state, FileState::Failed);
        assert!(file.dead_lettered);
        assert!(file.error_message.is_some());
        let pending = controller.pending_dead_letters().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].status, DeadLetterStatus::Pending);
    }

    #[tokio::test]
    async fn test_missing_source_is_permanent_failure() {
        let fx = fixture(LifecycleConfig::default());
        let file_id = upload(&fx, "a.csv", "sha-a", DISTRIBUTION_CSV);
        let other = Pipeline::new(
            fx.pipeline.controller().clone(),
            Arc::new(PipelineConfig::default()),
            Arc::new(MemorySourceProvider::new()),
        );

        let outcome = other.ingest(&file_id, "worker-1", &NoopProgress).await.unwrap();
        assert!(matches!(
            outcome,
            IngestOutcome::Failed {
                kind: FailureKind::Permanent,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_invalid_rows_are_counted_not_loaded() {
        let fx = fixture(LifecycleConfig::default());
        let csv = "\
Data;Hora;Turno;Vagão;Curral;Dieta;Realizado
15/01/2024;06:30;Manhã;Bahman;C12;TERMINACAO;900
15/01/2024;06:45;Manhã;Bahman;C13;TERMINACAO;-5
15/01/2024;14:00;Manhã;Bahman;C14;TERMINACAO;900
";
        let file_id = upload(&fx, "a.csv", "sha-a", csv);

        let outcome = fx.pipeline.ingest(&file_id, "worker-1", &NoopProgress).await.unwrap();
        match outcome {
            IngestOutcome::Finished { report, .. } => {
                assert_eq!(report.rows_total, 3);
                assert_eq!(report.rows_failed, 2);
                assert_eq!(report.facts_inserted, 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_all_rows_invalid_still_loads_file() {
        let fx = fixture(LifecycleConfig::default());
        let csv = "\
Data;Turno;Vagão;Curral;Dieta;Realizado
15/01/2024;Manhã;Bahman;C12;TERMINACAO;-1
15/01/2024;Manhã;Bahman;C13;TERMINACAO;-2
";
        let file_id = upload(&fx, "a.csv", "sha-a", csv);

        let outcome = fx.pipeline.ingest(&file_id, "worker-1", &NoopProgress).await.unwrap();
        match outcome {
            IngestOutcome::Finished { state, report } => {
                assert_eq!(state, FileState::Loaded);
                assert_eq!(report.rows_total, 2);
                assert_eq!(report.rows_loadable, 0);
                assert_eq!(report.rows_failed, 2);
                assert_eq!(report.facts_inserted, 0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let controller = fx.pipeline.controller();
        let file = controller.get_file(&file_id).unwrap();
        assert!(!file.dead_lettered);
        let run = controller.current_run(&file_id).unwrap().unwrap();
        assert_eq!(run.records_processed, 0);
        assert_eq!(run.records_failed, 2);
        let logs = controller.file_logs(&file_id).unwrap();
        assert!(logs
            .iter()
            .any(|l| l.level == LogLevel::Warn && l.message == "No loadable rows"));
    }

    #[tokio::test]
    async fn test_header_only_file_loads_nothing() {
        let fx = fixture(LifecycleConfig::default());
        let file_id = upload(
            &fx,
            "a.csv",
            "sha-a",
            "Data;Turno;Vagão;Curral;Dieta;Realizado\n",
        );

        let outcome = fx.pipeline.ingest(&file_id, "worker-1", &NoopProgress).await.unwrap();
        match outcome {
            IngestOutcome::Finished { state, report } => {
                assert_eq!(state, FileState::Loaded);
                assert_eq!(report.rows_total, 0);
                assert_eq!(report.rows_failed, 0);
            }
            other => panic!("unexpected outcome {:?}", other),
        }
        let file = fx.pipeline.controller().get_file(&file_id).unwrap();
        assert!(!file.dead_lettered);
        assert!(fx.pipeline.controller().pending_dead_letters().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failed_fact_chunk_does_not_fail_file() {
        let mut config = PipelineConfig::default();
        config.batch.batch_size = 1;
        config.batch.max_retries = 0;
        let fx = fixture_with(LifecycleConfig::default(), config);
        fx.pipeline
            .controller()
            .database()
            .with_conn(|conn| {
                conn.execute_batch(
                    "CREATE TRIGGER reject_c13 BEFORE INSERT ON fact_records
                     WHEN NEW.natural_key LIKE '%C13%'
                     BEGIN SELECT RAISE(ABORT, 'disk fault'); END;",
                )
                .map_err(DatabaseError::from)
            })
            .unwrap();
        let file_id = upload(&fx, "a.csv", "sha-a", DISTRIBUTION_CSV);

        let outcome = fx.pipeline.ingest(&file_id, "worker-1", &NoopProgress).await.unwrap();
        match outcome {
            IngestOutcome::Finished { state, report } => {
                assert_eq!(state, FileState::Loaded);
                assert_eq!(report.facts_inserted, 1);
                assert_eq!(report.rows_loadable, 1);
                assert_eq!(report.rows_failed, 1);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let controller = fx.pipeline.controller();
        let run = controller.current_run(&file_id).unwrap().unwrap();
        assert_eq!(run.records_failed, 1);
        assert_eq!(run.retry_count, 0);
        let facts = controller.facts(ORG, None).unwrap();
        assert_eq!(facts.len(), 1);
        assert_eq!(facts[0].load_count, 1);
        let logs = controller.file_logs(&file_id).unwrap();
        assert!(logs
            .iter()
            .any(|l| l.level == LogLevel::Warn && l.message.starts_with("Fact writes failed")));
    }

    #[tokio::test]
    async fn test_failed_file_waits_for_scheduled_retry() {
        let fx = fixture(LifecycleConfig::default());
        let file_id = upload(&fx, "a.csv", "sha-a", DISTRIBUTION_CSV);
        let controller = fx.pipeline.controller();
        controller
            .transition(&file_id, Transition::new(FileState::Parsing, 1, "worker-0"))
            .unwrap();
        controller
            .record_failure(&file_id, 2, "worker-0", FailureKind::Transient, "database busy")
            .unwrap();

        let outcome = fx.pipeline.ingest(&file_id, "worker-1", &NoopProgress).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Superseded);
        let file = controller.get_file(&file_id).unwrap();
        assert_eq!(file.current_state, FileState::Failed);
        assert!(file.locked_by.is_none());
        assert_eq!(controller.runs_for_file(&file_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_leased_file_is_superseded() {
        let fx = fixture(LifecycleConfig::default());
        let file_id = upload(&fx, "a.csv", "sha-a", DISTRIBUTION_CSV);
        fx.pipeline
            .controller()
            .acquire_lease(&file_id, "worker-other")
            .unwrap();

        let outcome = fx.pipeline.ingest(&file_id, "worker-1", &NoopProgress).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Superseded);
        assert_eq!(
            fx.pipeline.controller().get_file(&file_id).unwrap().current_state,
            FileState::Uploaded
        );
    }

    /// Cancels the file as soon as parsing finishes.
    struct CancelAfterParse {
        controller: StateController,
        file_id: String,
        events: Mutex<Vec<ProgressEvent>>,
    }

    impl ProgressReporter for CancelAfterParse {
        fn report(&self, event: ProgressEvent) {
            if let ProgressEvent::Stage {
                state: FileState::Parsed,
                ..
            } = event
            {
                let file = self.controller.get_file(&self.file_id).unwrap();
                self.controller
                    .cancel(&self.file_id, "operator", file.version)
                    .unwrap();
            }
            self.events.lock().unwrap().push(event);
        }
    }

    #[tokio::test]
    async fn test_cancellation_between_stages_stops_pipeline() {
        let fx = fixture(LifecycleConfig::default());
        let file_id = upload(&fx, "a.csv", "sha-a", DISTRIBUTION_CSV);
        let progress = CancelAfterParse {
            controller: fx.pipeline.controller().clone(),
            file_id: file_id.clone(),
            events: Mutex::new(Vec::new()),
        };

        let outcome = fx.pipeline.ingest(&file_id, "worker-1", &progress).await.unwrap();

        assert_eq!(outcome, IngestOutcome::Cancelled);
        let file = fx.pipeline.controller().get_file(&file_id).unwrap();
        assert_eq!(file.current_state, FileState::Cancelled);
        assert!(file.locked_by.is_none());
        assert!(fx.pipeline.controller().facts(ORG, None).unwrap().is_empty());
        let events = progress.events.lock().unwrap();
        assert!(!events
            .iter()
            .any(|e| matches!(e, ProgressEvent::Failed { .. })));
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped_and_logged() {
        let fx = fixture(LifecycleConfig::default());
        let csv = "\
Data;Hora;Turno;Vagão;Curral;Dieta;Realizado
15/01/2024;06:30;Manhã;Bahman;C12;TERMINACAO;900
15/01/2024;06:45;Manhã
15/01/2024;07:00;Manhã;Bahman;C14;TERMINACAO;880
";
        let file_id = upload(&fx, "a.csv", "sha-a", csv);

        let outcome = fx.pipeline.ingest(&file_id, "worker-1", &NoopProgress).await.unwrap();
        match outcome {
            IngestOutcome::Finished { report, .. } => {
                assert_eq!(report.parse_errors, 1);
                assert_eq!(report.facts_inserted, 2);
            }
            other => panic!("unexpected outcome {:?}", other),
        }

        let logs = fx.pipeline.controller().file_logs(&file_id).unwrap();
        assert!(logs
            .iter()
            .any(|l| l.level == LogLevel::Warn && l.message.contains("malformed")));
    }
}
