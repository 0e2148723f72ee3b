//! CSV tokenization: separator detection and the streaming parser.

use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

pub mod quote;
pub mod separator;
pub mod stream;

pub use separator::{detect_separator, Detection, DetectionOptions, SeparatorScore};
pub use stream::{parse_stream, ParseOptions, ParseSummary, RowHandler};

/// Bytes read ahead of parsing for separator detection.
pub const SAMPLE_BYTES: usize = 64 * 1024;

/// One data line split into raw fields. `row_number` is the 1-based
/// physical line in the source file.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParsedRow {
    pub raw: Vec<String>,
    pub row_number: u64,
}

/// A malformed line. The line is skipped and parsing continues.
#[derive(Error, Debug, Clone, PartialEq, Serialize)]
#[error("Row {row}: {message}")]
pub struct ParsingError {
    pub row: u64,
    pub message: String,
}

/// Reads up to `limit` bytes from the start of `reader` for detection.
/// The caller chains the returned prefix back in front of the reader.
pub async fn read_sample<R>(reader: &mut R, limit: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let mut sample = Vec::with_capacity(limit.min(SAMPLE_BYTES));
    reader.take(limit as u64).read_to_end(&mut sample).await?;
    Ok(sample)
}
