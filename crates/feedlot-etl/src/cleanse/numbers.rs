//! Locale-aware decimal parsing (`1.250,50`, `R$ 3.100`, `850 kg`).

use std::sync::LazyLock;

use regex::Regex;

static RE_CURRENCY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:R\$|US\$|\$|€|£)\s*").unwrap());
static RE_UNIT_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s*(?:[A-Za-zÀ-ÿ]+\.?|%)$").unwrap());
static RE_NUMERIC_BODY: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[+-]?[\d][\d., ]*$").unwrap());
static RE_CANONICAL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^-?\d+(?:\.\d+)?$").unwrap());

/// Result of a locale parse, recording which decorations were removed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ParsedDecimal {
    pub value: f64,
    pub stripped_currency: bool,
    pub stripped_unit: bool,
}

/// Parses a number written with `.` thousands and `,` decimal separators,
/// tolerating currency prefixes and unit suffixes. Returns `None` when the
/// input does not look numeric at all.
pub fn parse_locale_decimal(input: &str) -> Option<ParsedDecimal> {
    let mut text = input.trim();
    if text.is_empty() {
        return None;
    }

    let mut stripped_currency = false;
    if let Some(m) = RE_CURRENCY.find(text) {
        text = &text[m.end()..];
        stripped_currency = true;
    }

    let mut stripped_unit = false;
    if let Some(m) = RE_UNIT_SUFFIX.find(text) {
        if m.start() > 0 {
            text = &text[..m.start()];
            stripped_unit = true;
        }
    }

    let text = text.trim();
    if !RE_NUMERIC_BODY.is_match(text) {
        return None;
    }

    let compact: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    let normalized = normalize_separators(&compact)?;
    let value: f64 = normalized.parse().ok()?;
    if !value.is_finite() {
        return None;
    }

    Some(ParsedDecimal {
        value,
        stripped_currency,
        stripped_unit,
    })
}

/// True when `input` is already in the plain `-123.45` form and reads the
/// same under locale rules (so `1.250` is not canonical: it means 1250).
pub fn is_canonical_number(input: &str) -> bool {
    let text = input.trim();
    if !RE_CANONICAL.is_match(text) {
        return false;
    }
    match (text.parse::<f64>(), parse_locale_decimal(text)) {
        (Ok(plain), Some(parsed)) => plain == parsed.value,
        _ => false,
    }
}

fn normalize_separators(text: &str) -> Option<String> {
    let last_dot = text.rfind('.');
    let last_comma = text.rfind(',');

    let normalized = match (last_dot, last_comma) {
        (Some(dot), Some(comma)) => {
            if comma > dot {
                text.replace('.', "").replace(',', ".")
            } else {
                text.replace(',', "")
            }
        }
        (None, Some(_)) => {
            if text.matches(',').count() == 1 {
                text.replace(',', ".")
            } else {
                text.replace(',', "")
            }
        }
        (Some(dot), None) => {
            let dots = text.matches('.').count();
            let integer_part = text[..dot].trim_start_matches(['+', '-']);
            let fraction = &text[dot + 1..];
            if dots > 1 || (fraction.len() == 3 && !integer_part.is_empty() && integer_part != "0")
            {
                text.replace('.', "")
            } else {
                text.to_string()
            }
        }
        (None, None) => text.to_string(),
    };

    if normalized.matches('.').count() > 1 {
        return None;
    }
    Some(normalized)
}
