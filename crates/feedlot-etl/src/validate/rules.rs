//! Field-level checks: presence, enums, formats, ranges and dates.
//!
//! Produces a [`TypedRecord`] when every field passes, otherwise the full
//! list of field errors.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveTime};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::catalog::{fields, treatment::TREATMENT_TYPES, PipelineType, Shift};
use crate::cleanse::FieldRole;
use crate::mapping::FieldType;
use crate::record::{FieldValue, Record};

use super::issue::{IssueCode, ValidationIssue};

static RE_HH_MM: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{2}:\d{2}$").unwrap());

/// Hard ceilings applied before any business rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Limits {
    pub max_quantity_kg: f64,
    pub max_head_count: f64,
}

/// A row whose fields all have the right shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypedRecord {
    pub pipeline: PipelineType,
    pub date: NaiveDate,
    pub time: Option<NaiveTime>,
    pub shift: Option<Shift>,
    pub quantity_kg: f64,
    pub planned_kg: Option<f64>,
    pub head_count: Option<u32>,
    pub reviewed: Option<bool>,
    /// Remaining text fields (equipment, pen, diet, names, notes).
    pub labels: BTreeMap<String, String>,
}

impl TypedRecord {
    pub fn label(&self, field: &str) -> Option<&str> {
        self.labels.get(field).map(String::as_str)
    }
}

pub fn validate_raw_data(
    pipeline: PipelineType,
    record: &Record,
    today: NaiveDate,
    limits: &Limits,
) -> Result<TypedRecord, Vec<ValidationIssue>> {
    let dictionary = pipeline.dictionary();
    let mut errors = Vec::new();

    let mut date = None;
    let mut time = None;
    let mut shift = None;
    let mut numbers: BTreeMap<&str, f64> = BTreeMap::new();
    let mut reviewed = None;
    let mut labels = BTreeMap::new();

    for (name, role) in pipeline.roles() {
        let Some(definition) = dictionary.get(name) else {
            continue;
        };
        let value = record.get(*name).unwrap_or(&FieldValue::Null);

        if value.is_blank() {
            if definition.required {
                errors.push(ValidationIssue::error(
                    name,
                    IssueCode::Required,
                    format!("{} is required", name),
                ));
            }
            continue;
        }

        match role {
            FieldRole::Date => match value {
                FieldValue::Date(d) if *d > today => errors.push(ValidationIssue::error(
                    name,
                    IssueCode::FutureDate,
                    format!("date {} is in the future", d),
                )),
                FieldValue::Date(d) => date = Some(*d),
                other => errors.push(ValidationIssue::error(
                    name,
                    IssueCode::InvalidFormat,
                    format!("'{}' is not a valid date", other),
                )),
            },
            FieldRole::Time => match parse_hh_mm(value) {
                Some(t) => time = Some(t),
                None => errors.push(ValidationIssue::error(
                    name,
                    IssueCode::InvalidFormat,
                    format!("'{}' is not a valid HH:MM time", value),
                )),
            },
            FieldRole::Shift => match value.as_text().and_then(Shift::from_canonical) {
                Some(s) => shift = Some(s),
                None => errors.push(ValidationIssue::error(
                    name,
                    IssueCode::InvalidEnum,
                    format!("'{}' is not one of MANHÃ, TARDE, NOITE", value),
                )),
            },
            FieldRole::TreatmentType => match value.as_text() {
                Some(t) if TREATMENT_TYPES.contains(&t) => {
                    labels.insert(name.to_string(), t.to_string());
                }
                _ => errors.push(ValidationIssue::error(
                    name,
                    IssueCode::InvalidEnum,
                    format!(
                        "'{}' is not one of {}",
                        value,
                        TREATMENT_TYPES.join(", ")
                    ),
                )),
            },
            FieldRole::Number => match value.as_number() {
                Some(n) => {
                    let max = if *name == fields::HEAD_COUNT {
                        limits.max_head_count
                    } else {
                        limits.max_quantity_kg
                    };
                    if !(0.0..=max).contains(&n) {
                        errors.push(ValidationIssue::error(
                            name,
                            IssueCode::OutOfRange,
                            format!("{} is outside 0..={}", n, max),
                        ));
                    } else if *name == fields::HEAD_COUNT && n.fract() != 0.0 {
                        errors.push(ValidationIssue::error(
                            name,
                            IssueCode::InvalidType,
                            format!("{} is not a whole number", n),
                        ));
                    } else {
                        numbers.insert(*name, n);
                    }
                }
                None => errors.push(ValidationIssue::error(
                    name,
                    IssueCode::InvalidType,
                    format!("'{}' is not a number", value),
                )),
            },
            _ if definition.field_type == FieldType::Boolean => match value.as_bool() {
                Some(b) => reviewed = Some(b),
                None => errors.push(ValidationIssue::error(
                    name,
                    IssueCode::InvalidType,
                    format!("'{}' is not a yes/no value", value),
                )),
            },
            _ => {
                labels.insert(name.to_string(), value.to_string());
            }
        }
    }

    if !errors.is_empty() {
        return Err(errors);
    }

    let quantity_field = pipeline.quantity_field();
    let (Some(date), Some(quantity_kg)) = (date, numbers.get(quantity_field).copied()) else {
        // Both are required in every dictionary, so this only triggers when
        // the record skipped mapping entirely.
        return Err(vec![ValidationIssue::error(
            if date.is_none() { fields::DATE } else { quantity_field },
            IssueCode::Required,
            "date and quantity are required",
        )]);
    };

    Ok(TypedRecord {
        pipeline,
        date,
        time,
        shift,
        quantity_kg,
        planned_kg: numbers.get(fields::PLANNED_KG).copied(),
        head_count: numbers.get(fields::HEAD_COUNT).map(|n| *n as u32),
        reviewed,
        labels,
    })
}

fn parse_hh_mm(value: &FieldValue) -> Option<NaiveTime> {
    let text = value.as_text()?;
    if !RE_HH_MM.is_match(text) {
        return None;
    }
    NaiveTime::parse_from_str(text, "%H:%M").ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const LIMITS: Limits = Limits {
        max_quantity_kg: 100_000.0,
        max_head_count: 5_000.0,
    };

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()
    }

    fn distribution_row() -> Record {
        let mut record = Record::new();
        record.insert(
            fields::DATE.into(),
            FieldValue::Date(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()),
        );
        record.insert(fields::TIME.into(), FieldValue::text("06:30"));
        record.insert(fields::SHIFT.into(), FieldValue::text("MANHÃ"));
        record.insert(fields::EQUIPMENT.into(), FieldValue::text("BAHMAN"));
        record.insert(fields::PEN.into(), FieldValue::text("C12"));
        record.insert(fields::DIET.into(), FieldValue::text("TERMINACAO"));
        record.insert(fields::ACTUAL_KG.into(), FieldValue::Number(1250.5));
        record.insert(fields::REVIEWED.into(), FieldValue::Bool(false));
        record
    }

    #[test]
    fn test_valid_row_is_typed() {
        let typed =
            validate_raw_data(PipelineType::Distribution, &distribution_row(), today(), &LIMITS)
                .unwrap();
        assert_eq!(typed.quantity_kg, 1250.5);
        assert_eq!(typed.shift, Some(Shift::Morning));
        assert_eq!(typed.time, NaiveTime::from_hms_opt(6, 30, 0));
        assert_eq!(typed.label(fields::PEN), Some("C12"));
        assert_eq!(typed.reviewed, Some(false));
    }

    #[test]
    fn test_missing_required_fields_collected() {
        let mut record = distribution_row();
        record.insert(fields::PEN.into(), FieldValue::Null);
        record.remove(fields::DIET);

        let errors =
            validate_raw_data(PipelineType::Distribution, &record, today(), &LIMITS).unwrap_err();
        assert_eq!(errors.len(), 2);
        assert!(errors.iter().all(|e| e.code == IssueCode::Required));
    }

    #[test]
    fn test_future_date_rejected() {
        let mut record = distribution_row();
        record.insert(
            fields::DATE.into(),
            FieldValue::Date(NaiveDate::from_ymd_opt(2024, 3, 1).unwrap()),
        );
        let errors =
            validate_raw_data(PipelineType::Distribution, &record, today(), &LIMITS).unwrap_err();
        assert_eq!(errors[0].code, IssueCode::FutureDate);
    }

    #[test]
    fn test_format_enum_and_type_errors() {
        let mut record = distribution_row();
        record.insert(fields::TIME.into(), FieldValue::text("6h"));
        record.insert(fields::SHIFT.into(), FieldValue::text("BRUNCH"));
        record.insert(fields::ACTUAL_KG.into(), FieldValue::text("muito"));

        let errors =
            validate_raw_data(PipelineType::Distribution, &record, today(), &LIMITS).unwrap_err();
        let codes: Vec<IssueCode> = errors.iter().map(|e| e.code).collect();
        assert!(codes.contains(&IssueCode::InvalidFormat));
        assert!(codes.contains(&IssueCode::InvalidEnum));
        assert!(codes.contains(&IssueCode::InvalidType));
    }

    #[test]
    fn test_out_of_range_quantity() {
        let mut record = distribution_row();
        record.insert(fields::ACTUAL_KG.into(), FieldValue::Number(-3.0));
        let errors =
            validate_raw_data(PipelineType::Distribution, &record, today(), &LIMITS).unwrap_err();
        assert_eq!(errors[0].code, IssueCode::OutOfRange);
    }

    #[test]
    fn test_treatment_type_enum() {
        let mut record = Record::new();
        record.insert(
            fields::DATE.into(),
            FieldValue::Date(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()),
        );
        record.insert(fields::TIME.into(), FieldValue::text("07:00"));
        record.insert(fields::PEN.into(), FieldValue::text("C1"));
        record.insert(fields::FEEDER.into(), FieldValue::text("João"));
        record.insert(fields::TREATMENT_TYPE.into(), FieldValue::text("BANHO"));
        record.insert(fields::QUANTITY_KG.into(), FieldValue::Number(300.0));

        let errors =
            validate_raw_data(PipelineType::Treatment, &record, today(), &LIMITS).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, fields::TREATMENT_TYPE);

        record.insert(fields::TREATMENT_TYPE.into(), FieldValue::text("TRATO"));
        record.insert(fields::HEAD_COUNT.into(), FieldValue::Number(120.0));
        let typed = validate_raw_data(PipelineType::Treatment, &record, today(), &LIMITS).unwrap();
        assert_eq!(typed.head_count, Some(120));
        assert_eq!(typed.shift, None);
    }
}
