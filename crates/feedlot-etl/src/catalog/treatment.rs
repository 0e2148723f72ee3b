//! Feeding treatment events: per-pen deliveries, adjustments and bunk reads
//! logged by the feeder on duty.

use crate::cleanse::FieldRole;
use crate::mapping::{FieldDefinition, FieldDictionary, FieldType};

use super::fields::*;
use super::{non_negative, whole_count};

pub const ROLES: &[(&str, FieldRole)] = &[
    (DATE, FieldRole::Date),
    (TIME, FieldRole::Time),
    (SHIFT, FieldRole::Shift),
    (PEN, FieldRole::Pen),
    (FEEDER, FieldRole::PersonName),
    (TREATMENT_TYPE, FieldRole::TreatmentType),
    (DIET, FieldRole::Label),
    (QUANTITY_KG, FieldRole::Number),
    (HEAD_COUNT, FieldRole::Number),
    (NOTES, FieldRole::Plain),
];

pub const KEY_FIELDS: &[&str] = &[TIME, PEN, FEEDER, TREATMENT_TYPE];

/// Treatment types accepted after alias canonicalization.
pub const TREATMENT_TYPES: &[&str] = &["TRATO", "REPASSE", "AJUSTE", "LEITURA"];

pub fn dictionary() -> FieldDictionary {
    FieldDictionary::new()
        .field(
            FieldDefinition::new(DATE, FieldType::Date)
                .required()
                .aliases(&["data", "dt", "data_evento"]),
        )
        .field(
            FieldDefinition::new(TIME, FieldType::String)
                .required()
                .aliases(&["hora", "horario", "horário"]),
        )
        .field(FieldDefinition::new(SHIFT, FieldType::String).aliases(&["turno", "periodo"]))
        .field(
            FieldDefinition::new(PEN, FieldType::String)
                .required()
                .aliases(&["curral", "baia", "lote"]),
        )
        .field(
            FieldDefinition::new(FEEDER, FieldType::String)
                .required()
                .aliases(&["tratador", "alimentador", "funcionario", "funcionário"]),
        )
        .field(
            FieldDefinition::new(TREATMENT_TYPE, FieldType::String)
                .required()
                .aliases(&["tipo", "tipo_trato", "tipo de trato", "evento"]),
        )
        .field(FieldDefinition::new(DIET, FieldType::String).aliases(&["dieta", "racao", "ração"]))
        .field(
            FieldDefinition::new(QUANTITY_KG, FieldType::Number)
                .required()
                .aliases(&["quantidade", "quantidade_kg", "kg", "peso"])
                .validate(non_negative),
        )
        .field(
            FieldDefinition::new(HEAD_COUNT, FieldType::Number)
                .aliases(&["cabecas", "cabeças", "animais", "qtd_animais"])
                .validate(whole_count),
        )
        .field(
            FieldDefinition::new(NOTES, FieldType::String)
                .aliases(&["obs", "observacao", "observação"]),
        )
}
