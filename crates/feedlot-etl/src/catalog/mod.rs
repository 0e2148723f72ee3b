//! Pipeline catalog: the three kinds of feedlot export and their fields.
//!
//! Each pipeline module declares its header dictionary, the cleansing role
//! of every field and the business fields that make up its natural key.

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

use crate::cleanse::FieldRole;
use crate::mapping::FieldDictionary;
use crate::record::FieldValue;

pub mod distribution;
pub mod loading;
pub mod treatment;

/// Canonical field names shared by the pipelines.
pub mod fields {
    pub const DATE: &str = "date";
    pub const TIME: &str = "time";
    pub const SHIFT: &str = "shift";
    pub const EQUIPMENT: &str = "equipment";
    pub const PEN: &str = "pen";
    pub const DIET: &str = "diet";
    pub const INGREDIENT: &str = "ingredient";
    pub const PLANNED_KG: &str = "planned_kg";
    pub const ACTUAL_KG: &str = "actual_kg";
    pub const OPERATOR: &str = "operator";
    pub const FEEDER: &str = "feeder";
    pub const TREATMENT_TYPE: &str = "treatment_type";
    pub const QUANTITY_KG: &str = "quantity_kg";
    pub const HEAD_COUNT: &str = "head_count";
    pub const REVIEWED: &str = "reviewed";
    pub const NOTES: &str = "notes";
}

/// Kind of operator export a file contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineType {
    /// Mixer-wagon loading (ingredients loaded per diet batch).
    Loading,
    /// Feed distribution to pens.
    Distribution,
    /// Per-pen feeding treatment events (deliveries, adjustments, bunk reads).
    Treatment,
}

impl PipelineType {
    pub const ALL: [PipelineType; 3] = [
        PipelineType::Loading,
        PipelineType::Distribution,
        PipelineType::Treatment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineType::Loading => "loading",
            PipelineType::Distribution => "distribution",
            PipelineType::Treatment => "treatment",
        }
    }

    pub fn dictionary(&self) -> FieldDictionary {
        match self {
            PipelineType::Loading => loading::dictionary(),
            PipelineType::Distribution => distribution::dictionary(),
            PipelineType::Treatment => treatment::dictionary(),
        }
    }

    pub fn roles(&self) -> &'static [(&'static str, FieldRole)] {
        match self {
            PipelineType::Loading => loading::ROLES,
            PipelineType::Distribution => distribution::ROLES,
            PipelineType::Treatment => treatment::ROLES,
        }
    }

    /// Business fields that, with organization and date, identify a row.
    pub fn key_fields(&self) -> &'static [&'static str] {
        match self {
            PipelineType::Loading => loading::KEY_FIELDS,
            PipelineType::Distribution => distribution::KEY_FIELDS,
            PipelineType::Treatment => treatment::KEY_FIELDS,
        }
    }

    /// Field holding the quantity checked against outlier thresholds.
    pub fn quantity_field(&self) -> &'static str {
        match self {
            PipelineType::Loading | PipelineType::Distribution => fields::ACTUAL_KG,
            PipelineType::Treatment => fields::QUANTITY_KG,
        }
    }
}

impl fmt::Display for PipelineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PipelineType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "loading" => Ok(PipelineType::Loading),
            "distribution" => Ok(PipelineType::Distribution),
            "treatment" => Ok(PipelineType::Treatment),
            other => Err(format!("Unknown pipeline type: {}", other)),
        }
    }
}

/// Coarse time-of-day bucket (turno) used for feeding schedules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Shift {
    #[serde(rename = "MANHÃ")]
    Morning,
    #[serde(rename = "TARDE")]
    Afternoon,
    #[serde(rename = "NOITE")]
    Night,
}

impl Shift {
    pub const ALL: [Shift; 3] = [Shift::Morning, Shift::Afternoon, Shift::Night];

    pub fn as_str(&self) -> &'static str {
        match self {
            Shift::Morning => "MANHÃ",
            Shift::Afternoon => "TARDE",
            Shift::Night => "NOITE",
        }
    }

    /// Parses the canonical spelling produced by the cleanser.
    pub fn from_canonical(value: &str) -> Option<Shift> {
        Shift::ALL.into_iter().find(|s| s.as_str() == value)
    }

    /// Morning 04:00–11:59, afternoon 12:00–17:59, night otherwise.
    pub fn from_time(time: NaiveTime) -> Shift {
        match time.hour() {
            4..=11 => Shift::Morning,
            12..=17 => Shift::Afternoon,
            _ => Shift::Night,
        }
    }
}

impl fmt::Display for Shift {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejects negative numbers. Deferred locale text is left to the cleanser.
pub(crate) fn non_negative(value: &FieldValue) -> Result<(), String> {
    match value {
        FieldValue::Number(n) if *n < 0.0 => Err(format!("must not be negative, got {}", n)),
        _ => Ok(()),
    }
}

/// Rejects negative or fractional numbers.
pub(crate) fn whole_count(value: &FieldValue) -> Result<(), String> {
    match value {
        FieldValue::Number(n) if *n < 0.0 || n.fract() != 0.0 => {
            Err(format!("must be a whole non-negative count, got {}", n))
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_type_round_trip_through_str() {
        for kind in PipelineType::ALL {
            assert_eq!(kind.as_str().parse::<PipelineType>().unwrap(), kind);
        }
        assert!("unknown".parse::<PipelineType>().is_err());
    }

    #[test]
    fn test_shift_buckets() {
        let at = |h, m| NaiveTime::from_hms_opt(h, m, 0).unwrap();
        assert_eq!(Shift::from_time(at(6, 30)), Shift::Morning);
        assert_eq!(Shift::from_time(at(12, 0)), Shift::Afternoon);
        assert_eq!(Shift::from_time(at(17, 59)), Shift::Afternoon);
        assert_eq!(Shift::from_time(at(19, 0)), Shift::Night);
        assert_eq!(Shift::from_time(at(2, 0)), Shift::Night);
    }

    #[test]
    fn test_every_key_field_has_a_role() {
        for kind in PipelineType::ALL {
            let roles = kind.roles();
            for key in kind.key_fields() {
                assert!(
                    roles.iter().any(|(name, _)| name == key),
                    "{} key field {} has no cleansing role",
                    kind,
                    key
                );
            }
        }
    }

    #[test]
    fn test_every_dictionary_field_has_a_role() {
        for kind in PipelineType::ALL {
            let roles = kind.roles();
            for field in kind.dictionary().iter() {
                assert!(
                    roles.iter().any(|(name, _)| *name == field.name),
                    "{} field {} has no cleansing role",
                    kind,
                    field.name
                );
            }
        }
    }

    #[test]
    fn test_validators() {
        assert!(non_negative(&FieldValue::Number(-1.0)).is_err());
        assert!(non_negative(&FieldValue::text("1.250,00")).is_ok());
        assert!(whole_count(&FieldValue::Number(2.5)).is_err());
        assert!(whole_count(&FieldValue::Number(120.0)).is_ok());
    }
}
