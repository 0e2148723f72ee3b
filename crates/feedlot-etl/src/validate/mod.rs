//! Business validation in two phases.
//!
//! Phase one ([`rules::validate_raw_data`]) checks each field on its own and
//! yields a [`TypedRecord`]. Phase two derives the event timestamp,
//! canonical shift and natural key ([`BusinessValidator::process_data`]) and
//! applies cross-field rules ([`BusinessValidator::validate_business_logic`]).
//! Codes listed as soft never make a row invalid.

use std::collections::HashSet;

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};

use crate::catalog::{fields, PipelineType, Shift};
use crate::cleanse::CleanseWarning;
use crate::error::ConfigError;
use crate::natural_key::natural_key;
use crate::record::Record;

pub mod issue;
pub mod rules;

pub use issue::{IssueCode, Severity, ValidationIssue, ValidationStatus};
pub use rules::{validate_raw_data, Limits, TypedRecord};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OperatingWindow {
    /// Inclusive `HH:MM`.
    pub start: String,
    /// Exclusive `HH:MM`.
    pub end: String,
}

impl Default for OperatingWindow {
    fn default() -> Self {
        Self {
            start: "04:00".to_string(),
            end: "22:00".to_string(),
        }
    }
}

impl OperatingWindow {
    pub fn bounds(&self) -> Result<(NaiveTime, NaiveTime), ConfigError> {
        let parse = |value: &str| {
            NaiveTime::parse_from_str(value, "%H:%M").map_err(|e| ConfigError::Validation {
                message: format!("Invalid operating window time '{}': {}", value, e),
            })
        };
        let start = parse(&self.start)?;
        let end = parse(&self.end)?;
        if start >= end {
            return Err(ConfigError::Validation {
                message: format!(
                    "Operating window start {} must be before end {}",
                    self.start, self.end
                ),
            });
        }
        Ok((start, end))
    }
}

/// Quantities below `low` or above `high` are flagged as outliers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuantityRange {
    pub low: f64,
    pub high: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuantityThresholds {
    pub loading: QuantityRange,
    pub distribution: QuantityRange,
    pub treatment: QuantityRange,
}

impl Default for QuantityThresholds {
    fn default() -> Self {
        Self {
            loading: QuantityRange {
                low: 100.0,
                high: 15_000.0,
            },
            distribution: QuantityRange {
                low: 5.0,
                high: 3_000.0,
            },
            treatment: QuantityRange {
                low: 1.0,
                high: 2_000.0,
            },
        }
    }
}

impl QuantityThresholds {
    pub fn for_pipeline(&self, pipeline: PipelineType) -> QuantityRange {
        match pipeline {
            PipelineType::Loading => self.loading,
            PipelineType::Distribution => self.distribution,
            PipelineType::Treatment => self.treatment,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationConfig {
    pub operating_window: OperatingWindow,
    pub thresholds: QuantityThresholds,
    pub soft_codes: Vec<IssueCode>,
    pub max_quantity_kg: f64,
    pub max_head_count: u32,
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            operating_window: OperatingWindow::default(),
            thresholds: QuantityThresholds::default(),
            soft_codes: vec![IssueCode::SuspiciousTime, IssueCode::LowQuantity],
            max_quantity_kg: 100_000.0,
            max_head_count: 10_000,
        }
    }
}

/// A typed record with its derived attributes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedRecord {
    #[serde(flatten)]
    pub typed: TypedRecord,
    pub event_at: NaiveDateTime,
    /// Explicit shift, or the one implied by the time of day.
    pub canonical_shift: Option<Shift>,
    pub natural_key: String,
}

/// Final verdict for one row.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordOutcome {
    pub status: ValidationStatus,
    pub processed: Option<ProcessedRecord>,
    pub issues: Vec<ValidationIssue>,
}

impl RecordOutcome {
    pub fn errors(&self) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Error)
            .collect()
    }

    pub fn warnings(&self) -> Vec<&ValidationIssue> {
        self.issues
            .iter()
            .filter(|i| i.severity == Severity::Warning)
            .collect()
    }

    pub fn natural_key(&self) -> Option<&str> {
        self.processed.as_ref().map(|p| p.natural_key.as_str())
    }
}

/// Per-pipeline validator. Immutable after construction and shared across
/// validation threads by reference.
#[derive(Debug, Clone)]
pub struct BusinessValidator {
    pipeline: PipelineType,
    window: (NaiveTime, NaiveTime),
    range: QuantityRange,
    soft_codes: HashSet<IssueCode>,
    limits: Limits,
    today: NaiveDate,
}

impl BusinessValidator {
    pub fn new(pipeline: PipelineType, config: &ValidationConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            pipeline,
            window: config.operating_window.bounds()?,
            range: config.thresholds.for_pipeline(pipeline),
            soft_codes: config.soft_codes.iter().copied().collect(),
            limits: Limits {
                max_quantity_kg: config.max_quantity_kg,
                max_head_count: f64::from(config.max_head_count),
            },
            today: Local::now().date_naive(),
        })
    }

    /// Overrides the reference date used for the future-date check.
    pub fn with_today(mut self, today: NaiveDate) -> Self {
        self.today = today;
        self
    }

    pub fn pipeline(&self) -> PipelineType {
        self.pipeline
    }

    pub fn validate_raw_data(&self, record: &Record) -> Result<TypedRecord, Vec<ValidationIssue>> {
        rules::validate_raw_data(self.pipeline, record, self.today, &self.limits)
    }

    pub fn process_data(&self, typed: TypedRecord, organization_id: &str) -> ProcessedRecord {
        let time = typed.time.unwrap_or(NaiveTime::MIN);
        let event_at = typed.date.and_time(time);
        let canonical_shift = typed.shift.or_else(|| typed.time.map(Shift::from_time));

        let parts: Vec<String> = self
            .pipeline
            .key_fields()
            .iter()
            .map(|field| match *field {
                fields::SHIFT => canonical_shift
                    .map(|s| s.as_str().to_string())
                    .unwrap_or_default(),
                fields::TIME => typed
                    .time
                    .map(|t| t.format("%H:%M").to_string())
                    .unwrap_or_default(),
                other => typed.label(other).unwrap_or_default().to_string(),
            })
            .collect();
        let part_refs: Vec<&str> = parts.iter().map(String::as_str).collect();
        let natural_key = natural_key(organization_id, typed.date, &part_refs);

        ProcessedRecord {
            typed,
            event_at,
            canonical_shift,
            natural_key,
        }
    }

    pub fn validate_business_logic(&self, processed: &ProcessedRecord) -> Vec<ValidationIssue> {
        let typed = &processed.typed;
        let mut issues = Vec::new();

        if let Some(time) = typed.time {
            let (start, end) = self.window;
            if time < start || time >= end {
                issues.push(self.issue(
                    fields::TIME,
                    IssueCode::SuspiciousTime,
                    format!(
                        "{} is outside the operating window {}-{}",
                        time.format("%H:%M"),
                        start.format("%H:%M"),
                        end.format("%H:%M")
                    ),
                ));
            }

            if let Some(shift) = typed.shift {
                let implied = Shift::from_time(time);
                if implied != shift {
                    issues.push(self.issue(
                        fields::SHIFT,
                        IssueCode::ShiftTimeMismatch,
                        format!(
                            "shift {} does not match time {} ({})",
                            shift,
                            time.format("%H:%M"),
                            implied
                        ),
                    ));
                }
            }
        }

        let quantity_field = self.pipeline.quantity_field();
        if typed.quantity_kg > self.range.high {
            issues.push(self.issue(
                quantity_field,
                IssueCode::HighQuantity,
                format!("{} kg is above {} kg", typed.quantity_kg, self.range.high),
            ));
        } else if typed.quantity_kg < self.range.low {
            issues.push(self.issue(
                quantity_field,
                IssueCode::LowQuantity,
                format!("{} kg is below {} kg", typed.quantity_kg, self.range.low),
            ));
        }

        issues
    }

    fn issue(&self, field: &str, code: IssueCode, message: String) -> ValidationIssue {
        if self.soft_codes.contains(&code) {
            ValidationIssue::warning(field, code, message)
        } else {
            ValidationIssue::error(field, code, message)
        }
    }

    /// Runs both phases on a cleansed record. Cleanser warnings are carried
    /// as `normalized` warnings.
    pub fn validate(
        &self,
        cleaned: &Record,
        cleanse_warnings: &[CleanseWarning],
        organization_id: &str,
    ) -> RecordOutcome {
        let mut issues: Vec<ValidationIssue> = cleanse_warnings
            .iter()
            .map(|w| ValidationIssue::warning(&w.field, IssueCode::Normalized, w.message.clone()))
            .collect();

        let typed = match self.validate_raw_data(cleaned) {
            Ok(typed) => typed,
            Err(errors) => {
                issues.extend(errors);
                return RecordOutcome {
                    status: ValidationStatus::Invalid,
                    processed: None,
                    issues,
                };
            }
        };

        let processed = self.process_data(typed, organization_id);
        issues.extend(self.validate_business_logic(&processed));

        let status = if issues.iter().any(|i| i.severity == Severity::Error) {
            ValidationStatus::Invalid
        } else if issues.is_empty() {
            ValidationStatus::Valid
        } else {
            ValidationStatus::Warning
        };

        RecordOutcome {
            status,
            processed: Some(processed),
            issues,
        }
    }
}
