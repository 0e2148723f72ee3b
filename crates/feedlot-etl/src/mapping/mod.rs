//! Header mapping: localized column headers → canonical field names.

pub mod dictionary;
pub mod error;
pub mod fuzzy;
pub mod mapper;

pub use dictionary::{FieldDefinition, FieldDictionary, FieldType, FieldValidator};
pub use error::MappingError;
pub use fuzzy::levenshtein;
pub use mapper::{
    FieldError, HeaderAnalysis, HeaderMapper, HeaderSuggestion, MappedHeader, MappedRow,
    MatchKind,
};
