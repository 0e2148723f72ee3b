//! Date and time-of-day normalization.

use std::sync::LazyLock;

use chrono::{NaiveDate, NaiveTime};
use regex::Regex;

static RE_BR_DATE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})/(\d{1,2})/(\d{4})$").unwrap());
static RE_TIME: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d{1,2})\s*[:hH]\s*(\d{2})(?::(\d{2}))?$").unwrap());

/// Parses `DD/MM/YYYY`.
pub fn parse_br_date(input: &str) -> Option<NaiveDate> {
    let caps = RE_BR_DATE.captures(input.trim())?;
    let day: u32 = caps[1].parse().ok()?;
    let month: u32 = caps[2].parse().ok()?;
    let year: i32 = caps[3].parse().ok()?;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Parses `YYYY-MM-DD`.
pub fn parse_iso_date(input: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d").ok()
}

/// Parses `H:MM`, `HH:MM`, `HH:MM:SS` and the `06h30` spelling.
pub fn parse_time_of_day(input: &str) -> Option<NaiveTime> {
    let caps = RE_TIME.captures(input.trim())?;
    let hour: u32 = caps[1].parse().ok()?;
    let minute: u32 = caps[2].parse().ok()?;
    let second: u32 = caps
        .get(3)
        .and_then(|m| m.as_str().parse().ok())
        .unwrap_or(0);
    NaiveTime::from_hms_opt(hour, minute, second)
}

/// Renders a time as the canonical `HH:MM`.
pub fn format_time(time: NaiveTime) -> String {
    time.format("%H:%M").to_string()
}
