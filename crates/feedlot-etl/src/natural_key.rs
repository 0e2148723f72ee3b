//! Deterministic idempotency keys for fact records.
//!
//! `ORG8_YYYYMMDD_PART_PART…`: the first eight characters of the
//! organization id, the ISO event date and the pipeline's business fields.
//! Every part, the date included, is uppercased and stripped of anything
//! that is not a letter or digit, so cosmetic differences never split a
//! fact. `_` only ever appears as the part separator.

use chrono::NaiveDate;

const ORG_PREFIX_CHARS: usize = 8;

pub fn normalize_part(part: &str) -> String {
    part.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_uppercase)
        .collect()
}

pub fn natural_key(organization_id: &str, date: NaiveDate, parts: &[&str]) -> String {
    let org: String = organization_id.chars().take(ORG_PREFIX_CHARS).collect();

    let mut key = normalize_part(&org);
    key.push('_');
    key.push_str(&normalize_part(&date.format("%Y-%m-%d").to_string()));
    for part in parts {
        key.push('_');
        key.push_str(&normalize_part(part));
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, 15).unwrap()
    }

    #[test]
    fn test_layout() {
        let key = natural_key(
            "3f2a9c1e-77aa-4b1c-9d2e-000000000001",
            date(),
            &["MANHÃ", "vag-01", "Dieta Terminação", "milho moído"],
        );
        assert_eq!(key, "3F2A9C1E_20240115_MANHÃ_VAG01_DIETATERMINAÇÃO_MILHOMOÍDO");
    }

    #[test]
    fn test_deterministic_and_cosmetic_insensitive() {
        let a = natural_key("org-1", date(), &["C-12", "Bahman"]);
        let b = natural_key("org-1", date(), &["c12 ", "BAHMAN"]);
        assert_eq!(a, b);
        assert_eq!(a, natural_key("org-1", date(), &["C-12", "Bahman"]));
    }

    #[test]
    fn test_organization_sensitive() {
        let a = natural_key("aaaa1111", date(), &["C12"]);
        let b = natural_key("bbbb2222", date(), &["C12"]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_only_org_prefix_counts() {
        let a = natural_key("abcdefgh-one", date(), &["X"]);
        let b = natural_key("abcdefgh-two", date(), &["X"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_only_separators_are_non_alphanumeric() {
        let key = natural_key("org-1/x", date(), &["C-12", "Dieta/2"]);
        assert_eq!(key, "ORG1X_20240115_C12_DIETA2");
        assert!(key
            .split('_')
            .all(|part| part.chars().all(char::is_alphanumeric)));
    }

    #[test]
    fn test_time_part_loses_colon() {
        let key = natural_key("org", date(), &["06:30", "C1"]);
        assert_eq!(key, "ORG_20240115_0630_C1");
    }
}
