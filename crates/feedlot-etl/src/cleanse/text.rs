//! Free-text canonicalization: alias tables, code cleanup and name casing.

use std::collections::HashMap;

use crate::config::schema::AliasConfig;

/// Lowercases, strips Portuguese diacritics and collapses whitespace.
/// Used as the lookup key for every alias table.
pub fn fold_key(input: &str) -> String {
    let folded: String = input
        .trim()
        .chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ã' | 'ä' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'õ' | 'ö' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ç' => 'c',
            other => other,
        })
        .collect();
    folded.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Folded key with everything but letters and digits removed. Two values
/// with the same skeleton differ only trivially (case, accents, spacing).
pub fn skeleton(input: &str) -> String {
    fold_key(input)
        .chars()
        .filter(|c| c.is_alphanumeric())
        .collect()
}

/// Uppercases and strips non-alphanumeric noise: `"vag-01 "` → `"VAG01"`.
pub fn normalize_code(input: &str) -> String {
    input
        .chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_uppercase)
        .collect()
}

/// Uppercases and collapses inner whitespace, keeping punctuation.
pub fn normalize_label(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_uppercase()
}

const NAME_PARTICLES: &[&str] = &["da", "das", "de", "do", "dos", "e"];

/// Title-cases a person name, keeping Portuguese particles lowercase
/// except in first position: `"JOÃO DA SILVA"` → `"João da Silva"`.
pub fn title_case_name(input: &str) -> String {
    input
        .split_whitespace()
        .enumerate()
        .map(|(i, word)| {
            let lower = word.to_lowercase();
            if i > 0 && NAME_PARTICLES.contains(&lower.as_str()) {
                return lower;
            }
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Folded-key → canonical spelling lookups for the free-text fields.
#[derive(Debug, Clone)]
pub struct AliasTables {
    shifts: HashMap<String, String>,
    equipment: HashMap<String, String>,
    treatment_types: HashMap<String, String>,
}

impl Default for AliasTables {
    fn default() -> Self {
        let shifts = table(&[
            ("manha", "MANHÃ"),
            ("m", "MANHÃ"),
            ("matutino", "MANHÃ"),
            ("morning", "MANHÃ"),
            ("tarde", "TARDE"),
            ("t", "TARDE"),
            ("vespertino", "TARDE"),
            ("afternoon", "TARDE"),
            ("noite", "NOITE"),
            ("n", "NOITE"),
            ("noturno", "NOITE"),
            ("madrugada", "NOITE"),
            ("night", "NOITE"),
        ]);
        let equipment = table(&[
            ("bahman", "BAHMAN"),
            ("bahman n", "BAHMAN"),
            ("bahmann", "BAHMAN"),
            ("casale", "CASALE"),
            ("siltomac", "SILTOMAC"),
            ("silto mac", "SILTOMAC"),
            ("trioliet", "TRIOLIET"),
        ]);
        let treatment_types = table(&[
            ("trato", "TRATO"),
            ("fornecimento", "TRATO"),
            ("repasse", "REPASSE"),
            ("ajuste", "AJUSTE"),
            ("leitura", "LEITURA"),
            ("leitura de cocho", "LEITURA"),
        ]);
        Self {
            shifts,
            equipment,
            treatment_types,
        }
    }
}

fn table(entries: &[(&str, &str)]) -> HashMap<String, String> {
    entries
        .iter()
        .map(|(alias, canonical)| (fold_key(alias), canonical.to_string()))
        .collect()
}

impl AliasTables {
    /// Default tables extended with operator-configured aliases.
    pub fn with_config(config: &AliasConfig) -> Self {
        let mut tables = Self::default();
        for (alias, canonical) in &config.shifts {
            tables.shifts.insert(fold_key(alias), canonical.clone());
        }
        for (alias, canonical) in &config.equipment {
            tables.equipment.insert(fold_key(alias), canonical.clone());
        }
        for (alias, canonical) in &config.treatment_types {
            tables
                .treatment_types
                .insert(fold_key(alias), canonical.clone());
        }
        tables
    }

    pub fn shift(&self, input: &str) -> Option<&str> {
        self.shifts.get(&fold_key(input)).map(String::as_str)
    }

    pub fn equipment(&self, input: &str) -> Option<&str> {
        self.equipment.get(&fold_key(input)).map(String::as_str)
    }

    pub fn treatment_type(&self, input: &str) -> Option<&str> {
        self.treatment_types.get(&fold_key(input)).map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_key() {
        assert_eq!(fold_key("  Manhã  "), "manha");
        assert_eq!(fold_key("Leitura   de  Cocho"), "leitura de cocho");
        assert_eq!(fold_key("AÇÃO"), "acao");
    }

    #[test]
    fn test_shift_aliases() {
        let tables = AliasTables::default();
        assert_eq!(tables.shift("manha"), Some("MANHÃ"));
        assert_eq!(tables.shift("MANHÃ"), Some("MANHÃ"));
        assert_eq!(tables.shift("Noturno"), Some("NOITE"));
        assert_eq!(tables.shift("brunch"), None);
    }

    #[test]
    fn test_equipment_alias() {
        let tables = AliasTables::default();
        assert_eq!(tables.equipment("bahman n"), Some("BAHMAN"));
        assert_eq!(tables.equipment("BAHMAN  N"), Some("BAHMAN"));
    }

    #[test]
    fn test_configured_aliases_extend_defaults() {
        let mut config = AliasConfig::default();
        config
            .equipment
            .insert("vagão azul".to_string(), "VAG01".to_string());
        let tables = AliasTables::with_config(&config);
        assert_eq!(tables.equipment("Vagao Azul"), Some("VAG01"));
        assert_eq!(tables.equipment("bahman"), Some("BAHMAN"));
    }

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code("vag-01 "), "VAG01");
        assert_eq!(normalize_code("C.12"), "C12");
    }

    #[test]
    fn test_title_case_name() {
        assert_eq!(title_case_name("JOÃO DA SILVA"), "João da Silva");
        assert_eq!(title_case_name("maria  dos santos e souza"), "Maria dos Santos e Souza");
        assert_eq!(title_case_name("da costa"), "Da Costa");
    }

    #[test]
    fn test_skeleton_ignores_case_and_accents() {
        assert_eq!(skeleton("MANHÃ"), skeleton("manha"));
        assert_ne!(skeleton("bahman n"), skeleton("BAHMAN"));
    }
}
