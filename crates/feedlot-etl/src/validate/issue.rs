//! Validation issue codes and row statuses.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueCode {
    Required,
    InvalidEnum,
    OutOfRange,
    InvalidFormat,
    InvalidType,
    FutureDate,
    SuspiciousTime,
    ShiftTimeMismatch,
    HighQuantity,
    LowQuantity,
    /// Value rewritten by the cleanser. Always a warning.
    Normalized,
}

impl IssueCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            IssueCode::Required => "required",
            IssueCode::InvalidEnum => "invalid_enum",
            IssueCode::OutOfRange => "out_of_range",
            IssueCode::InvalidFormat => "invalid_format",
            IssueCode::InvalidType => "invalid_type",
            IssueCode::FutureDate => "future_date",
            IssueCode::SuspiciousTime => "suspicious_time",
            IssueCode::ShiftTimeMismatch => "shift_time_mismatch",
            IssueCode::HighQuantity => "high_quantity",
            IssueCode::LowQuantity => "low_quantity",
            IssueCode::Normalized => "normalized",
        }
    }
}

impl fmt::Display for IssueCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IssueCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        serde_json::from_value(serde_json::Value::String(s.to_string()))
            .map_err(|_| format!("Unknown issue code: {}", s))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Error,
    Warning,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub field: String,
    pub code: IssueCode,
    pub message: String,
    pub severity: Severity,
}

impl ValidationIssue {
    pub fn error(field: &str, code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            code,
            message: message.into(),
            severity: Severity::Error,
        }
    }

    pub fn warning(field: &str, code: IssueCode, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            code,
            message: message.into(),
            severity: Severity::Warning,
        }
    }
}

/// Outcome of validation for one staged row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Pending,
    Valid,
    Warning,
    Invalid,
}

impl ValidationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValidationStatus::Pending => "pending",
            ValidationStatus::Valid => "valid",
            ValidationStatus::Warning => "warning",
            ValidationStatus::Invalid => "invalid",
        }
    }

    /// Valid and warning rows are promoted to facts.
    pub fn is_loadable(&self) -> bool {
        matches!(self, ValidationStatus::Valid | ValidationStatus::Warning)
    }
}

impl FromStr for ValidationStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ValidationStatus::Pending),
            "valid" => Ok(ValidationStatus::Valid),
            "warning" => Ok(ValidationStatus::Warning),
            "invalid" => Ok(ValidationStatus::Invalid),
            other => Err(format!("Unknown validation status: {}", other)),
        }
    }
}
