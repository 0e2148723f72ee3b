//! Field dictionaries: canonical field names with their type and aliases.

use serde::{Deserialize, Serialize};

use crate::record::FieldValue;

/// Declared type a mapped value is coerced to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
}

/// Per-field check run after coercion. Returns a human-readable reason on failure.
pub type FieldValidator = fn(&FieldValue) -> Result<(), String>;

#[derive(Debug, Clone)]
pub struct FieldDefinition {
    pub name: String,
    pub required: bool,
    pub field_type: FieldType,
    pub aliases: Vec<String>,
    pub validate: Option<FieldValidator>,
    pub default_value: Option<FieldValue>,
}

impl FieldDefinition {
    pub fn new(name: &str, field_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            required: false,
            field_type,
            aliases: Vec::new(),
            validate: None,
            default_value: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn aliases(mut self, aliases: &[&str]) -> Self {
        self.aliases
            .extend(aliases.iter().map(|alias| alias.to_string()));
        self
    }

    pub fn validate(mut self, validator: FieldValidator) -> Self {
        self.validate = Some(validator);
        self
    }

    pub fn default_value(mut self, value: FieldValue) -> Self {
        self.default_value = Some(value);
        self
    }
}

/// Ordered set of field definitions. Declaration order is preserved so
/// reports list fields the way the dictionary author wrote them.
#[derive(Debug, Clone, Default)]
pub struct FieldDictionary {
    fields: Vec<FieldDefinition>,
}

impl FieldDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn field(mut self, definition: FieldDefinition) -> Self {
        self.insert(definition);
        self
    }

    /// Inserts or replaces a definition with the same canonical name.
    pub fn insert(&mut self, definition: FieldDefinition) {
        if let Some(existing) = self.fields.iter_mut().find(|f| f.name == definition.name) {
            *existing = definition;
        } else {
            self.fields.push(definition);
        }
    }

    /// Adds extra aliases to an existing field. Unknown fields are ignored.
    pub fn extend_aliases(&mut self, name: &str, aliases: &[String]) {
        if let Some(field) = self.fields.iter_mut().find(|f| f.name == name) {
            for alias in aliases {
                if !field.aliases.contains(alias) {
                    field.aliases.push(alias.clone());
                }
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&FieldDefinition> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter()
    }

    pub fn required_fields(&self) -> impl Iterator<Item = &FieldDefinition> {
        self.fields.iter().filter(|f| f.required)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}
