//! Line-oriented streaming CSV parser.
//!
//! Reads from any [`AsyncRead`] one physical line at a time, so a file is
//! never held in memory. Rows are delivered to a [`RowHandler`] in batches;
//! malformed lines are reported and skipped.

use std::ops::ControlFlow;

use async_trait::async_trait;
use csv::{ReaderBuilder, StringRecord, Trim};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};

use super::quote::has_unclosed_quote;
use super::{ParsedRow, ParsingError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ParseOptions {
    #[serde(skip)]
    pub separator: u8,
    #[serde(skip)]
    pub quote: u8,
    pub skip_empty_lines: bool,
    pub trim_fields: bool,
    pub has_headers: bool,
    pub batch_size: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            separator: b',',
            quote: b'"',
            skip_empty_lines: true,
            trim_fields: true,
            has_headers: true,
            batch_size: 500,
        }
    }
}

impl ParseOptions {
    pub fn with_separator(mut self, separator: u8) -> Self {
        self.separator = separator;
        self
    }

    pub fn with_quote(mut self, quote: u8) -> Self {
        self.quote = quote;
        self
    }
}

/// Receives parser output. Returning [`ControlFlow::Break`] stops parsing
/// after the current line.
#[async_trait]
pub trait RowHandler: Send {
    async fn on_headers(&mut self, _headers: &[String]) -> ControlFlow<()> {
        ControlFlow::Continue(())
    }

    fn on_row(&mut self, _row: &ParsedRow) {}

    async fn on_batch(&mut self, rows: Vec<ParsedRow>) -> ControlFlow<()>;

    fn on_error(&mut self, _error: &ParsingError) {}
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParseSummary {
    pub headers: Vec<String>,
    pub total_rows: u64,
    pub errors: Vec<ParsingError>,
    /// The handler asked to stop before end of input.
    pub stopped: bool,
}

/// Streams `reader` through `handler`. Only I/O failures are returned as
/// errors; malformed lines end up in [`ParseSummary::errors`].
pub async fn parse_stream<R, H>(
    reader: R,
    options: &ParseOptions,
    handler: &mut H,
) -> std::io::Result<ParseSummary>
where
    R: AsyncRead + Unpin + Send,
    H: RowHandler + ?Sized,
{
    let mut lines = BufReader::new(reader);
    let mut buf = Vec::new();
    let mut summary = ParseSummary::default();
    let mut headers: Option<Vec<String>> = None;
    let mut batch = Vec::with_capacity(options.batch_size.max(1));
    let mut line_number: u64 = 0;

    loop {
        buf.clear();
        if lines.read_until(b'\n', &mut buf).await? == 0 {
            break;
        }
        line_number += 1;

        let decoded = String::from_utf8_lossy(&buf);
        let mut line = decoded.trim_end_matches(['\n', '\r']);
        if line_number == 1 {
            line = line.trim_start_matches('\u{feff}');
        }

        if options.skip_empty_lines && line.trim().is_empty() {
            continue;
        }

        let fields = match split_line(line, options) {
            Ok(fields) => fields,
            Err(message) => {
                report(&mut summary, handler, line_number, message);
                continue;
            }
        };

        if options.has_headers && headers.is_none() {
            let flow = handler.on_headers(&fields).await;
            summary.headers = fields.clone();
            headers = Some(fields);
            if flow.is_break() {
                summary.stopped = true;
                return Ok(summary);
            }
            continue;
        }

        if let Some(expected) = headers.as_ref().map(Vec::len) {
            if fields.len() != expected {
                let message = format!("expected {} fields, found {}", expected, fields.len());
                report(&mut summary, handler, line_number, message);
                continue;
            }
        }

        let row = ParsedRow {
            raw: fields,
            row_number: line_number,
        };
        handler.on_row(&row);
        summary.total_rows += 1;
        batch.push(row);

        if batch.len() >= options.batch_size.max(1) {
            let full = std::mem::replace(&mut batch, Vec::with_capacity(options.batch_size));
            if handler.on_batch(full).await.is_break() {
                summary.stopped = true;
                return Ok(summary);
            }
        }
    }

    if !batch.is_empty() && handler.on_batch(batch).await.is_break() {
        summary.stopped = true;
    }

    log::debug!(
        "Parsed {} rows from {} lines ({} malformed)",
        summary.total_rows,
        line_number,
        summary.errors.len()
    );

    Ok(summary)
}

fn report<H: RowHandler + ?Sized>(
    summary: &mut ParseSummary,
    handler: &mut H,
    row: u64,
    message: String,
) {
    let error = ParsingError { row, message };
    log::debug!("Skipping malformed line: {}", error);
    handler.on_error(&error);
    summary.errors.push(error);
}

/// Splits one physical line into fields.
fn split_line(line: &str, options: &ParseOptions) -> Result<Vec<String>, String> {
    if has_unclosed_quote(line, &[char::from(options.quote)]) {
        return Err("unclosed quote".to_string());
    }

    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .delimiter(options.separator)
        .quote(options.quote)
        .trim(if options.trim_fields {
            Trim::All
        } else {
            Trim::None
        })
        .from_reader(line.as_bytes());

    let mut record = StringRecord::new();
    match reader.read_record(&mut record) {
        Ok(true) => Ok(record.iter().map(str::to_string).collect()),
        Ok(false) => Ok(vec![String::new()]),
        Err(e) => Err(e.to_string()),
    }
}
