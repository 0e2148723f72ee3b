//! Header analysis and row mapping against a [`FieldDictionary`].

use std::collections::HashMap;

use serde::Serialize;

use crate::cleanse::{dates, numbers, text::fold_key};
use crate::record::{FieldValue, Record};

use super::dictionary::{FieldDictionary, FieldType};
use super::error::MappingError;
use super::fuzzy::levenshtein;

/// Default maximum edit distance for header suggestions.
pub const DEFAULT_SUGGESTION_DISTANCE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    Exact,
    Alias,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MappedHeader {
    pub header: String,
    pub index: usize,
    pub field: String,
    pub match_kind: MatchKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HeaderSuggestion {
    pub header: String,
    pub suggested_field: String,
    pub distance: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct HeaderAnalysis {
    pub mapped: Vec<MappedHeader>,
    pub unmapped: Vec<String>,
    pub missing_required: Vec<String>,
    pub confidence: f64,
    pub suggestions: Vec<HeaderSuggestion>,
}

impl HeaderAnalysis {
    /// Fails with [`MappingError::MissingRequired`] when a required field
    /// has no column.
    pub fn ensure_complete(&self) -> Result<(), MappingError> {
        if self.missing_required.is_empty() {
            Ok(())
        } else {
            Err(MappingError::MissingRequired {
                fields: self.missing_required.clone(),
            })
        }
    }

    pub fn mapped_fields(&self) -> impl Iterator<Item = &str> {
        self.mapped.iter().map(|m| m.field.as_str())
    }
}

/// A value that could not be coerced or failed its field validator.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FieldError {
    pub field: String,
    pub value: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MappedRow {
    pub row_number: u64,
    pub values: Record,
    pub errors: Vec<FieldError>,
    pub unmapped_fields: Vec<String>,
}

impl MappedRow {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Maps localized headers onto canonical field names.
///
/// Call [`analyze_headers`](Self::analyze_headers) once per file, then
/// [`map_row`](Self::map_row) for each data row.
#[derive(Debug, Clone)]
pub struct HeaderMapper {
    dictionary: FieldDictionary,
    case_sensitive: bool,
    suggestion_distance: usize,
    exact: HashMap<String, String>,
    aliases: HashMap<String, String>,
    analysis: Option<HeaderAnalysis>,
    columns: Vec<Option<String>>,
}

impl HeaderMapper {
    pub fn new(dictionary: FieldDictionary, case_sensitive: bool) -> Self {
        let mut mapper = Self {
            dictionary,
            case_sensitive,
            suggestion_distance: DEFAULT_SUGGESTION_DISTANCE,
            exact: HashMap::new(),
            aliases: HashMap::new(),
            analysis: None,
            columns: Vec::new(),
        };
        mapper.rebuild_lookup();
        mapper
    }

    pub fn with_suggestion_distance(mut self, distance: usize) -> Self {
        self.suggestion_distance = distance;
        self
    }

    pub fn dictionary(&self) -> &FieldDictionary {
        &self.dictionary
    }

    pub fn analysis(&self) -> Option<&HeaderAnalysis> {
        self.analysis.as_ref()
    }

    fn key(&self, header: &str) -> String {
        if self.case_sensitive {
            header.trim().to_string()
        } else {
            fold_key(header)
        }
    }

    fn rebuild_lookup(&mut self) {
        let mut exact = HashMap::new();
        let mut aliases = HashMap::new();
        for field in self.dictionary.iter() {
            exact.insert(self.key(&field.name), field.name.clone());
            for alias in &field.aliases {
                aliases
                    .entry(self.key(alias))
                    .or_insert_with(|| field.name.clone());
            }
        }
        self.exact = exact;
        self.aliases = aliases;
    }

    /// Matches each header by canonical name first, then by alias. Several
    /// headers may resolve to the same field; the first non-blank value wins
    /// when rows are mapped.
    pub fn analyze_headers(&mut self, headers: &[String]) -> &HeaderAnalysis {
        let mut analysis = HeaderAnalysis::default();
        let mut columns = Vec::with_capacity(headers.len());

        for (index, header) in headers.iter().enumerate() {
            let key = self.key(header);
            let matched = if let Some(field) = self.exact.get(&key) {
                Some((field.clone(), MatchKind::Exact))
            } else {
                self.aliases
                    .get(&key)
                    .map(|field| (field.clone(), MatchKind::Alias))
            };

            match matched {
                Some((field, match_kind)) => {
                    columns.push(Some(field.clone()));
                    analysis.mapped.push(MappedHeader {
                        header: header.clone(),
                        index,
                        field,
                        match_kind,
                    });
                }
                None => {
                    columns.push(None);
                    if header.trim().is_empty() {
                        continue;
                    }
                    analysis.unmapped.push(header.clone());
                    if let Some(suggestion) = self.suggest(header, &key) {
                        analysis.suggestions.push(suggestion);
                    }
                }
            }
        }

        analysis.missing_required = self
            .dictionary
            .required_fields()
            .filter(|f| !analysis.mapped.iter().any(|m| m.field == f.name))
            .map(|f| f.name.clone())
            .collect();

        let penalty = 0.4 * analysis.missing_required.len() as f64
            + 0.05 * analysis.unmapped.len() as f64;
        analysis.confidence = (1.0 - penalty).max(0.0);

        log::debug!(
            "Header analysis: {} mapped, {} unmapped, {} missing required, confidence {:.2}",
            analysis.mapped.len(),
            analysis.unmapped.len(),
            analysis.missing_required.len(),
            analysis.confidence
        );

        self.columns = columns;
        self.analysis.insert(analysis)
    }

    fn suggest(&self, header: &str, key: &str) -> Option<HeaderSuggestion> {
        let mut best: Option<(usize, &str)> = None;
        for field in self.dictionary.iter() {
            let candidates =
                std::iter::once(field.name.as_str()).chain(field.aliases.iter().map(String::as_str));
            for candidate in candidates {
                let distance = levenshtein(key, &self.key(candidate));
                if distance <= self.suggestion_distance
                    && best.map(|(d, _)| distance < d).unwrap_or(true)
                {
                    best = Some((distance, field.name.as_str()));
                }
            }
        }
        best.map(|(distance, field)| HeaderSuggestion {
            header: header.to_string(),
            suggested_field: field.to_string(),
            distance,
        })
    }

    /// Maps one data row using the last analysis. Coercion and validator
    /// failures are collected in [`MappedRow::errors`]; the row itself is
    /// always produced.
    pub fn map_row(
        &self,
        values: &[String],
        headers: &[String],
        row_number: u64,
    ) -> Result<MappedRow, MappingError> {
        if self.analysis.is_none() {
            return Err(MappingError::NotAnalyzed);
        }

        let mut raw: HashMap<&str, &str> = HashMap::new();
        let mut unmapped_fields = Vec::new();
        for (index, header) in headers.iter().enumerate() {
            let value = values.get(index).map(String::as_str).unwrap_or("");
            match self.columns.get(index).and_then(Option::as_ref) {
                Some(field) => {
                    let slot = raw.entry(field.as_str()).or_insert("");
                    if slot.trim().is_empty() {
                        *slot = value;
                    }
                }
                None if !header.trim().is_empty() => unmapped_fields.push(header.clone()),
                None => {}
            }
        }

        let mut row = MappedRow {
            row_number,
            values: Record::new(),
            errors: Vec::new(),
            unmapped_fields,
        };

        for field in self.dictionary.iter() {
            let text = raw.get(field.name.as_str()).map(|v| v.trim()).unwrap_or("");
            let value = if text.is_empty() {
                field.default_value.clone().unwrap_or(FieldValue::Null)
            } else {
                match coerce(text, field.field_type) {
                    Ok(value) => value,
                    Err(message) => {
                        row.errors.push(FieldError {
                            field: field.name.clone(),
                            value: text.to_string(),
                            message,
                        });
                        FieldValue::text(text)
                    }
                }
            };

            if let Some(validate) = field.validate {
                if !value.is_null() {
                    if let Err(message) = validate(&value) {
                        row.errors.push(FieldError {
                            field: field.name.clone(),
                            value: value.to_string(),
                            message,
                        });
                    }
                }
            }

            row.values.insert(field.name.clone(), value);
        }

        Ok(row)
    }
}

/// Coerces trimmed, non-empty text to `field_type`. Locale-formatted numbers
/// and `DD/MM/YYYY` dates stay text for the cleanser.
fn coerce(text: &str, field_type: FieldType) -> Result<FieldValue, String> {
    match field_type {
        FieldType::String => Ok(FieldValue::text(text)),
        FieldType::Number => {
            if numbers::is_canonical_number(text) {
                text.parse::<f64>()
                    .map(FieldValue::Number)
                    .map_err(|e| e.to_string())
            } else if numbers::parse_locale_decimal(text).is_some() {
                Ok(FieldValue::text(text))
            } else {
                Err(format!("'{}' is not a number", text))
            }
        }
        FieldType::Boolean => parse_bool(text)
            .map(FieldValue::Bool)
            .ok_or_else(|| format!("'{}' is not a yes/no value", text)),
        FieldType::Date => {
            if let Some(date) = dates::parse_iso_date(text) {
                Ok(FieldValue::Date(date))
            } else if dates::parse_br_date(text).is_some() {
                Ok(FieldValue::text(text))
            } else {
                Err(format!("'{}' is not a date", text))
            }
        }
    }
}

pub fn parse_bool(text: &str) -> Option<bool> {
    match fold_key(text).as_str() {
        "sim" | "s" | "yes" | "y" | "true" | "1" | "verdadeiro" => Some(true),
        "nao" | "n" | "no" | "false" | "0" | "falso" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::PipelineType;
    use crate::mapping::FieldDefinition;

    fn dictionary() -> FieldDictionary {
        FieldDictionary::new()
            .field(
                FieldDefinition::new("date", FieldType::Date)
                    .required()
                    .aliases(&["data"]),
            )
            .field(
                FieldDefinition::new("pen", FieldType::String)
                    .required()
                    .aliases(&["curral", "baia"]),
            )
            .field(
                FieldDefinition::new("kg", FieldType::Number)
                    .aliases(&["peso"])
                    .validate(|v| match v {
                        FieldValue::Number(n) if *n < 0.0 => Err("negative".to_string()),
                        _ => Ok(()),
                    }),
            )
            .field(
                FieldDefinition::new("reviewed", FieldType::Boolean)
                    .aliases(&["conferido"])
                    .default_value(FieldValue::Bool(false)),
            )
    }

    fn headers(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_exact_and_alias_matches() {
        let mut mapper = HeaderMapper::new(dictionary(), false);
        let analysis = mapper.analyze_headers(&headers(&["date", "Curral", "PESO"])).clone();

        assert_eq!(analysis.mapped.len(), 3);
        assert_eq!(analysis.mapped[0].match_kind, MatchKind::Exact);
        assert_eq!(analysis.mapped[1].field, "pen");
        assert_eq!(analysis.mapped[1].match_kind, MatchKind::Alias);
        assert!(analysis.missing_required.is_empty());
        assert!(analysis.unmapped.is_empty());
        assert_eq!(analysis.confidence, 1.0);
    }

    #[test]
    fn test_all_aliases_map_fully_in_any_case() {
        let dict = dictionary();
        let all: Vec<String> = dict
            .iter()
            .flat_map(|f| f.aliases.iter().map(|a| a.to_uppercase()))
            .collect();
        let mut mapper = HeaderMapper::new(dict, false);
        let analysis = mapper.analyze_headers(&all);

        assert_eq!(analysis.mapped.len(), all.len());
        assert!(analysis.missing_required.is_empty());
        assert_eq!(analysis.confidence, 1.0);
    }

    fn mixed_case(text: &str) -> String {
        text.chars()
            .enumerate()
            .flat_map(|(i, c)| {
                if i % 2 == 0 {
                    c.to_uppercase().collect::<Vec<_>>()
                } else {
                    c.to_lowercase().collect::<Vec<_>>()
                }
            })
            .collect()
    }

    #[test]
    fn test_every_catalog_dictionary_maps_its_own_names() {
        for pipeline in PipelineType::ALL {
            let dict = pipeline.dictionary();
            let expected: Vec<(String, String)> = dict
                .iter()
                .flat_map(|f| {
                    std::iter::once(f.name.clone())
                        .chain(f.aliases.iter().cloned())
                        .map(move |h| (mixed_case(&h), f.name.clone()))
                })
                .collect();
            let headers: Vec<String> = expected.iter().map(|(h, _)| h.clone()).collect();

            let mut mapper = HeaderMapper::new(dict, false);
            let analysis = mapper.analyze_headers(&headers).clone();

            assert!(analysis.unmapped.is_empty(), "{}: {:?}", pipeline, analysis.unmapped);
            assert!(analysis.missing_required.is_empty(), "{}", pipeline);
            assert_eq!(analysis.mapped.len(), headers.len(), "{}", pipeline);
            assert_eq!(analysis.confidence, 1.0, "{}", pipeline);
            for (mapped, (header, field)) in analysis.mapped.iter().zip(&expected) {
                assert_eq!(&mapped.header, header);
                assert_eq!(&mapped.field, field, "{} header {}", pipeline, header);
            }
        }
    }

    #[test]
    fn test_case_sensitive_rejects_other_case() {
        let mut mapper = HeaderMapper::new(dictionary(), true);
        let analysis = mapper.analyze_headers(&headers(&["DATE", "curral"]));

        assert_eq!(analysis.missing_required, vec!["date"]);
        assert_eq!(analysis.unmapped, vec!["DATE"]);
    }

    #[test]
    fn test_confidence_penalties_and_suggestions() {
        let mut mapper = HeaderMapper::new(dictionary(), false);
        let analysis = mapper.analyze_headers(&headers(&["dta", "curral", "extra"]));

        assert_eq!(analysis.missing_required, vec!["date"]);
        assert_eq!(analysis.unmapped, vec!["dta", "extra"]);
        assert!((analysis.confidence - 0.5).abs() < 1e-9);
        assert_eq!(analysis.suggestions.len(), 1);
        assert_eq!(analysis.suggestions[0].header, "dta");
        assert_eq!(analysis.suggestions[0].suggested_field, "date");
        assert!(analysis.ensure_complete().is_err());
    }

    #[test]
    fn test_confidence_floors_at_zero() {
        let dict = FieldDictionary::new()
            .field(FieldDefinition::new("a", FieldType::String).required())
            .field(FieldDefinition::new("b", FieldType::String).required())
            .field(FieldDefinition::new("c", FieldType::String).required());
        let mut mapper = HeaderMapper::new(dict, false);
        assert_eq!(mapper.analyze_headers(&headers(&["x"])).confidence, 0.0);
    }

    #[test]
    fn test_map_row_before_analysis_fails() {
        let mapper = HeaderMapper::new(dictionary(), false);
        let result = mapper.map_row(&headers(&["x"]), &headers(&["data"]), 2);
        assert_eq!(result, Err(MappingError::NotAnalyzed));
    }

    #[test]
    fn test_map_row_coerces_and_defers_locale_values() {
        let hs = headers(&["data", "curral", "peso", "conferido", "extra"]);
        let mut mapper = HeaderMapper::new(dictionary(), false);
        mapper.analyze_headers(&hs);

        let row = mapper
            .map_row(&headers(&["15/01/2024", " C-12 ", "1.250,50", "sim", "x"]), &hs, 2)
            .unwrap();

        assert!(row.is_clean());
        assert_eq!(row.values["date"], FieldValue::text("15/01/2024"));
        assert_eq!(row.values["pen"], FieldValue::text("C-12"));
        assert_eq!(row.values["kg"], FieldValue::text("1.250,50"));
        assert_eq!(row.values["reviewed"], FieldValue::Bool(true));
        assert_eq!(row.unmapped_fields, vec!["extra"]);
    }

    #[test]
    fn test_map_row_applies_defaults_and_collects_errors() {
        let hs = headers(&["date", "pen", "kg"]);
        let mut mapper = HeaderMapper::new(dictionary(), false);
        mapper.analyze_headers(&hs);

        let row = mapper
            .map_row(&headers(&["2024-01-15", "C1", "-5"]), &hs, 3)
            .unwrap();
        assert_eq!(row.values["reviewed"], FieldValue::Bool(false));
        assert_eq!(row.values["kg"], FieldValue::Number(-5.0));
        assert_eq!(row.errors.len(), 1);
        assert_eq!(row.errors[0].field, "kg");

        let row = mapper
            .map_row(&headers(&["ontem", "C1", "abc"]), &hs, 4)
            .unwrap();
        assert_eq!(row.errors.len(), 2);
        assert_eq!(row.values["date"], FieldValue::text("ontem"));
    }

    #[test]
    fn test_first_non_blank_duplicate_column_wins() {
        let hs = headers(&["curral", "baia", "date"]);
        let mut mapper = HeaderMapper::new(dictionary(), false);
        mapper.analyze_headers(&hs);

        let row = mapper
            .map_row(&headers(&["", "B7", "2024-01-15"]), &hs, 2)
            .unwrap();
        assert_eq!(row.values["pen"], FieldValue::text("B7"));
    }

    #[test]
    fn test_boolean_spellings() {
        for yes in ["Sim", "S", "yes", "TRUE", "1", "y", "Verdadeiro"] {
            assert_eq!(parse_bool(yes), Some(true), "{}", yes);
        }
        for no in ["não", "NAO", "n", "no", "false", "0", "Falso"] {
            assert_eq!(parse_bool(no), Some(false), "{}", no);
        }
        assert_eq!(parse_bool("talvez"), None);
    }
}
