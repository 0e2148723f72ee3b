//! Feed distribution exports: one row per delivery of a diet to a pen.

use crate::cleanse::FieldRole;
use crate::mapping::{FieldDefinition, FieldDictionary, FieldType};
use crate::record::FieldValue;

use super::fields::*;
use super::non_negative;

pub const ROLES: &[(&str, FieldRole)] = &[
    (DATE, FieldRole::Date),
    (TIME, FieldRole::Time),
    (SHIFT, FieldRole::Shift),
    (EQUIPMENT, FieldRole::Equipment),
    (PEN, FieldRole::Pen),
    (DIET, FieldRole::Label),
    (PLANNED_KG, FieldRole::Number),
    (ACTUAL_KG, FieldRole::Number),
    (OPERATOR, FieldRole::PersonName),
    (REVIEWED, FieldRole::Plain),
];

pub const KEY_FIELDS: &[&str] = &[SHIFT, EQUIPMENT, PEN, DIET];

pub fn dictionary() -> FieldDictionary {
    FieldDictionary::new()
        .field(
            FieldDefinition::new(DATE, FieldType::Date)
                .required()
                .aliases(&["data", "dt", "data_trato", "data trato"]),
        )
        .field(
            FieldDefinition::new(TIME, FieldType::String)
                .aliases(&["hora", "horario", "horário", "hora_trato"]),
        )
        .field(
            FieldDefinition::new(SHIFT, FieldType::String)
                .required()
                .aliases(&["turno", "periodo", "período"]),
        )
        .field(
            FieldDefinition::new(EQUIPMENT, FieldType::String)
                .required()
                .aliases(&["vagao", "vagão", "equipamento", "misturador"]),
        )
        .field(
            FieldDefinition::new(PEN, FieldType::String)
                .required()
                .aliases(&["curral", "baia", "lote", "piquete"]),
        )
        .field(
            FieldDefinition::new(DIET, FieldType::String)
                .required()
                .aliases(&["dieta", "racao", "ração", "formula"]),
        )
        .field(
            FieldDefinition::new(PLANNED_KG, FieldType::Number)
                .aliases(&["previsto", "previsto_kg", "previsto (kg)", "meta_kg"])
                .validate(non_negative),
        )
        .field(
            FieldDefinition::new(ACTUAL_KG, FieldType::Number)
                .required()
                .aliases(&["realizado", "realizado_kg", "distribuido", "distribuído", "fornecido"])
                .validate(non_negative),
        )
        .field(
            FieldDefinition::new(OPERATOR, FieldType::String)
                .aliases(&["operador", "motorista", "responsavel", "responsável"]),
        )
        .field(
            FieldDefinition::new(REVIEWED, FieldType::Boolean)
                .aliases(&["conferido", "verificado"])
                .default_value(FieldValue::Bool(false)),
        )
}
