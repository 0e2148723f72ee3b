//! Field separator inference from a content sample.

use serde::{Deserialize, Serialize};

use super::quote::{count_unquoted, has_unclosed_quote};

/// Quote characters in order of preference. The first is the default.
const QUOTE_CANDIDATES: &[char] = &['"', '\''];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionOptions {
    /// Non-blank lines examined from the start of the sample.
    pub sample_lines: usize,
    pub min_confidence: f64,
    pub candidates: Vec<char>,
    /// Returned when detection is inconclusive.
    pub fallback: char,
}

impl Default for DetectionOptions {
    fn default() -> Self {
        Self {
            sample_lines: 10,
            min_confidence: 0.7,
            candidates: vec![',', ';', '\t', '|'],
            fallback: ',',
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeparatorScore {
    pub separator: char,
    /// Quote character the counts were taken with.
    pub quote: char,
    pub total: usize,
    pub consistency: f64,
    pub score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub separator: char,
    /// Quote character fields are wrapped in. The parser must use the same.
    pub quote: char,
    pub confidence: f64,
    pub scores: Vec<SeparatorScore>,
}

impl Detection {
    fn fallback(options: &DetectionOptions, scores: Vec<SeparatorScore>) -> Self {
        Self {
            separator: options.fallback,
            quote: QUOTE_CANDIDATES[0],
            confidence: 0.0,
            scores,
        }
    }

    /// Separator as the byte the csv reader expects. Multi-byte separators
    /// are never candidates, so this only falls back for misconfiguration.
    pub fn separator_byte(&self) -> u8 {
        u8::try_from(self.separator).unwrap_or(b',')
    }

    pub fn quote_byte(&self) -> u8 {
        u8::try_from(self.quote).unwrap_or(b'"')
    }
}

/// Scores every candidate over the first `sample_lines` non-blank lines.
/// Never fails: empty or ambiguous content yields the fallback separator
/// with confidence 0.
pub fn detect_separator(content: &str, options: &DetectionOptions) -> Detection {
    let lines: Vec<&str> = content
        .trim_start_matches('\u{feff}')
        .lines()
        .filter(|line| !line.trim().is_empty())
        .take(options.sample_lines.max(1))
        .collect();

    if lines.is_empty() {
        return Detection::fallback(options, Vec::new());
    }

    let sample_size = lines.len() as f64;
    let mut scores: Vec<SeparatorScore> = options
        .candidates
        .iter()
        .map(|&separator| {
            let quote = quote_for(&lines, separator);
            let counts: Vec<usize> = lines
                .iter()
                .map(|line| count_unquoted(line, separator, &[quote]))
                .collect();
            let total: usize = counts.iter().sum();
            let lines_with = counts.iter().filter(|&&c| c > 0).count();
            let consistency = consistency(&counts, lines_with);
            let score =
                (total as f64 / sample_size) * consistency * (lines_with as f64 / sample_size);
            SeparatorScore {
                separator,
                quote,
                total,
                consistency,
                score,
            }
        })
        .collect();

    scores.sort_by(|a, b| b.score.total_cmp(&a.score));

    let top = scores.first().map(|s| s.score).unwrap_or(0.0);
    let second = scores.get(1).map(|s| s.score).unwrap_or(0.0);
    let confidence = (top / (second * 2.0).max(0.1)).clamp(0.0, 1.0);

    match scores.first() {
        Some(best) if best.score > 0.0 && confidence >= options.min_confidence => {
            let separator = best.separator;
            let quote = best.quote;
            log::debug!(
                "Detected separator {:?} (quote {:?}) with confidence {:.2}",
                separator,
                quote,
                confidence
            );
            Detection {
                separator,
                quote,
                confidence,
                scores,
            }
        }
        _ => {
            log::debug!(
                "Separator detection inconclusive (confidence {:.2}), using {:?}",
                confidence,
                options.fallback
            );
            Detection::fallback(options, scores)
        }
    }
}

/// `"` whenever it opens a field. `'` only when it opens fields, `"` does
/// not, and every `'` span closes, so apostrophes in names stay literal.
fn quote_for(lines: &[&str], separator: char) -> char {
    let opens_field = |quote: char| {
        lines.iter().any(|line| {
            line.split(separator)
                .any(|field| field.trim_start().starts_with(quote))
        })
    };
    QUOTE_CANDIDATES
        .iter()
        .copied()
        .enumerate()
        .find(|&(preference, quote)| {
            opens_field(quote)
                && (preference == 0 || lines.iter().all(|line| !has_unclosed_quote(line, &[quote])))
        })
        .map(|(_, quote)| quote)
        .unwrap_or(QUOTE_CANDIDATES[0])
}

/// `1 − stddev/mean` of the per-line counts, clamped at 0.
fn consistency(counts: &[usize], lines_with: usize) -> f64 {
    match lines_with {
        0 => 0.0,
        1 => 1.0,
        _ => {
            let n = counts.len() as f64;
            let mean = counts.iter().sum::<usize>() as f64 / n;
            let variance = counts
                .iter()
                .map(|&c| (c as f64 - mean).powi(2))
                .sum::<f64>()
                / n;
            (1.0 - variance.sqrt() / mean).max(0.0)
        }
    }
}
