//! Locale-aware cleansing applied after header mapping.
//!
//! Every transform is total: it always yields a value, and records a
//! [`CleanseWarning`] when the value changed in a way a reviewer should see.
//! Values that cannot be cleaned are passed through untouched for the
//! business validator to reject.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;

use crate::catalog::PipelineType;
use crate::record::{FieldValue, Record};

pub mod dates;
pub mod numbers;
pub mod text;

pub use text::AliasTables;

/// How the cleanser treats a canonical field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldRole {
    Date,
    Time,
    Number,
    Shift,
    Equipment,
    Pen,
    TreatmentType,
    /// Diet and ingredient names: uppercased, whitespace collapsed.
    Label,
    PersonName,
    /// Left as mapped apart from blank → null.
    Plain,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CleanseWarning {
    pub field: String,
    pub original: String,
    pub cleaned: String,
    pub message: String,
}

#[derive(Debug, Clone, Default)]
pub struct CleanseOutcome {
    pub cleaned: Record,
    pub warnings: Vec<CleanseWarning>,
}

/// Stateless per-pipeline cleanser. Cheap to share across threads.
#[derive(Debug, Clone)]
pub struct Cleanser {
    roles: HashMap<&'static str, FieldRole>,
    aliases: Arc<AliasTables>,
}

impl Cleanser {
    pub fn new(pipeline: PipelineType, aliases: Arc<AliasTables>) -> Self {
        Self {
            roles: pipeline.roles().iter().copied().collect(),
            aliases,
        }
    }

    pub fn cleanse(&self, record: &Record) -> CleanseOutcome {
        let mut outcome = CleanseOutcome::default();

        for (field, value) in record {
            let role = self
                .roles
                .get(field.as_str())
                .copied()
                .unwrap_or(FieldRole::Plain);
            let cleaned = self.cleanse_value(field, role, value, &mut outcome.warnings);
            outcome.cleaned.insert(field.clone(), cleaned);
        }

        outcome
    }

    fn cleanse_value(
        &self,
        field: &str,
        role: FieldRole,
        value: &FieldValue,
        warnings: &mut Vec<CleanseWarning>,
    ) -> FieldValue {
        if value.is_blank() {
            return FieldValue::Null;
        }

        let text = match value {
            FieldValue::Text(s) => s.trim(),
            // Already typed by the mapper.
            other => return other.clone(),
        };

        match role {
            FieldRole::Date => self.cleanse_date(field, text, warnings),
            FieldRole::Time => match dates::parse_time_of_day(text) {
                Some(time) => FieldValue::Text(dates::format_time(time)),
                None => FieldValue::text(text),
            },
            FieldRole::Number => self.cleanse_number(field, text, warnings),
            FieldRole::Shift => {
                let cleaned = match self.aliases.shift(text) {
                    Some(canonical) => canonical.to_string(),
                    None => text::normalize_label(text),
                };
                note_change(field, text, cleaned, warnings)
            }
            FieldRole::Equipment => {
                let cleaned = match self.aliases.equipment(text) {
                    Some(canonical) => canonical.to_string(),
                    None => text::normalize_code(text),
                };
                note_change(field, text, cleaned, warnings)
            }
            FieldRole::Pen => note_change(field, text, text::normalize_code(text), warnings),
            FieldRole::TreatmentType => {
                let cleaned = match self.aliases.treatment_type(text) {
                    Some(canonical) => canonical.to_string(),
                    None => text::normalize_code(text),
                };
                note_change(field, text, cleaned, warnings)
            }
            FieldRole::Label => FieldValue::Text(text::normalize_label(text)),
            FieldRole::PersonName => FieldValue::Text(text::title_case_name(text)),
            FieldRole::Plain => FieldValue::text(text),
        }
    }

    fn cleanse_date(
        &self,
        field: &str,
        text: &str,
        warnings: &mut Vec<CleanseWarning>,
    ) -> FieldValue {
        if let Some(date) = dates::parse_iso_date(text) {
            return FieldValue::Date(date);
        }
        match dates::parse_br_date(text) {
            Some(date) => {
                let converted = date.format("%Y-%m-%d").to_string();
                warnings.push(CleanseWarning {
                    field: field.to_string(),
                    original: text.to_string(),
                    cleaned: converted.clone(),
                    message: format!("Converted date '{}' to '{}'", text, converted),
                });
                FieldValue::Date(date)
            }
            None => FieldValue::text(text),
        }
    }

    fn cleanse_number(
        &self,
        field: &str,
        text: &str,
        warnings: &mut Vec<CleanseWarning>,
    ) -> FieldValue {
        match numbers::parse_locale_decimal(text) {
            Some(parsed) => {
                if parsed.stripped_currency || parsed.stripped_unit {
                    warnings.push(CleanseWarning {
                        field: field.to_string(),
                        original: text.to_string(),
                        cleaned: parsed.value.to_string(),
                        message: format!(
                            "Stripped symbols from '{}', read as {}",
                            text, parsed.value
                        ),
                    });
                }
                FieldValue::Number(parsed.value)
            }
            None => FieldValue::text(text),
        }
    }
}

/// Records a warning when `cleaned` differs from `original` beyond case,
/// accents and spacing.
fn note_change(
    field: &str,
    original: &str,
    cleaned: String,
    warnings: &mut Vec<CleanseWarning>,
) -> FieldValue {
    if text::skeleton(original) != text::skeleton(&cleaned) {
        warnings.push(CleanseWarning {
            field: field.to_string(),
            original: original.to_string(),
            cleaned: cleaned.clone(),
            message: format!("Normalized '{}' to '{}'", original, cleaned),
        });
    }
    FieldValue::Text(cleaned)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::fields;
    use chrono::NaiveDate;

    fn cleanser(pipeline: PipelineType) -> Cleanser {
        Cleanser::new(pipeline, Arc::new(AliasTables::default()))
    }

    fn record(entries: &[(&str, FieldValue)]) -> Record {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_brazilian_date_converted_with_one_warning() {
        let outcome = cleanser(PipelineType::Distribution)
            .cleanse(&record(&[(fields::DATE, FieldValue::text("15/01/2024"))]));

        assert_eq!(
            outcome.cleaned[fields::DATE],
            FieldValue::Date(NaiveDate::from_ymd_opt(2024, 1, 15).unwrap())
        );
        assert_eq!(outcome.cleaned[fields::DATE].to_string(), "2024-01-15");
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].original, "15/01/2024");
        assert_eq!(outcome.warnings[0].cleaned, "2024-01-15");
    }

    #[test]
    fn test_locale_decimal_becomes_number() {
        let outcome = cleanser(PipelineType::Loading)
            .cleanse(&record(&[(fields::ACTUAL_KG, FieldValue::text("1.250,50"))]));

        assert_eq!(outcome.cleaned[fields::ACTUAL_KG], FieldValue::Number(1250.5));
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_currency_symbol_is_warned() {
        let outcome = cleanser(PipelineType::Loading)
            .cleanse(&record(&[(fields::PLANNED_KG, FieldValue::text("850 kg"))]));

        assert_eq!(outcome.cleaned[fields::PLANNED_KG], FieldValue::Number(850.0));
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn test_blank_values_become_null() {
        let outcome = cleanser(PipelineType::Loading).cleanse(&record(&[
            (fields::OPERATOR, FieldValue::text("   ")),
            (fields::TIME, FieldValue::text("")),
        ]));

        assert!(outcome.cleaned[fields::OPERATOR].is_null());
        assert!(outcome.cleaned[fields::TIME].is_null());
    }

    #[test]
    fn test_shift_alias_casing_only_is_silent() {
        let outcome = cleanser(PipelineType::Distribution)
            .cleanse(&record(&[(fields::SHIFT, FieldValue::text("manha"))]));

        assert_eq!(outcome.cleaned[fields::SHIFT], FieldValue::text("MANHÃ"));
        assert!(outcome.warnings.is_empty());
    }

    #[test]
    fn test_shift_abbreviation_is_warned() {
        let outcome = cleanser(PipelineType::Distribution)
            .cleanse(&record(&[(fields::SHIFT, FieldValue::text("T"))]));

        assert_eq!(outcome.cleaned[fields::SHIFT], FieldValue::text("TARDE"));
        assert_eq!(outcome.warnings.len(), 1);
    }

    #[test]
    fn test_equipment_alias_and_pen_code() {
        let outcome = cleanser(PipelineType::Distribution).cleanse(&record(&[
            (fields::EQUIPMENT, FieldValue::text("bahman n")),
            (fields::PEN, FieldValue::text("c-12")),
        ]));

        assert_eq!(outcome.cleaned[fields::EQUIPMENT], FieldValue::text("BAHMAN"));
        assert_eq!(outcome.cleaned[fields::PEN], FieldValue::text("C12"));
        assert_eq!(outcome.warnings.len(), 1);
        assert_eq!(outcome.warnings[0].field, fields::EQUIPMENT);
    }

    #[test]
    fn test_person_name_title_cased() {
        let outcome = cleanser(PipelineType::Treatment)
            .cleanse(&record(&[(fields::FEEDER, FieldValue::text("JOSÉ DOS SANTOS"))]));

        assert_eq!(outcome.cleaned[fields::FEEDER], FieldValue::text("José dos Santos"));
    }

    #[test]
    fn test_time_padded() {
        let outcome = cleanser(PipelineType::Treatment)
            .cleanse(&record(&[(fields::TIME, FieldValue::text("6h30"))]));

        assert_eq!(outcome.cleaned[fields::TIME], FieldValue::text("06:30"));
    }

    #[test]
    fn test_unparseable_values_pass_through() {
        let outcome = cleanser(PipelineType::Loading).cleanse(&record(&[
            (fields::DATE, FieldValue::text("ontem")),
            (fields::ACTUAL_KG, FieldValue::text("muito")),
        ]));

        assert_eq!(outcome.cleaned[fields::DATE], FieldValue::text("ontem"));
        assert_eq!(outcome.cleaned[fields::ACTUAL_KG], FieldValue::text("muito"));
    }
}
