//! Lenient date and time parsing for model-extracted event fields.
//!
//! Models are asked for ISO dates but regularly answer with the format printed
//! on the poster, often without a year, sometimes with a time of day or a
//! month name.

use chrono::{Datelike, Local, NaiveDate, NaiveDateTime, NaiveTime};
use regex::Regex;
use std::sync::OnceLock;

const DATE_TIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Date-only formats in the order they are tried. `true` marks formats with a
/// four digit year.
const DATE_FORMATS: &[(&str, bool)] = &[
    ("%Y-%m-%d", true),
    ("%d.%m.%Y", true),
    ("%d.%m.%y", false),
    ("%d/%m/%Y", true),
    ("%d/%m/%y", false),
    ("%Y/%m/%d", true),
];

/// Month-name formats for the loose stage, German names already mapped to English
const MONTH_NAME_FORMATS: &[&str] = &[
    "%B %d, %Y",
    "%B %d %Y",
    "%d %B %Y",
    "%d. %B %Y",
    "%d %B, %Y",
];

const GERMAN_MONTHS: &[(&str, &str)] = &[
    ("januar", "January"),
    ("jan", "Jan"),
    ("februar", "February"),
    ("feb", "Feb"),
    ("märz", "March"),
    ("maerz", "March"),
    ("mär", "Mar"),
    ("mai", "May"),
    ("juni", "June"),
    ("juli", "July"),
    ("oktober", "October"),
    ("okt", "Oct"),
    ("dezember", "December"),
    ("dez", "Dec"),
];

/// Parse an event date, filling in the current year when the text has none
pub fn parse_event_date(raw: &str) -> Option<NaiveDateTime> {
    parse_event_date_with_year(raw, Local::now().year())
}

/// Parse an event date, using `year` when the text carries no year
pub fn parse_event_date_with_year(raw: &str, year: i32) -> Option<NaiveDateTime> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }

    if let Some(parsed) = parse_date(raw, year) {
        return Some(parsed);
    }

    if let Some(parsed) = parse_loose(raw, year) {
        return Some(parsed);
    }

    tracing::debug!("Unable to parse event date '{}'", raw);
    None
}

/// Strict formats, then the same formats with `year` appended
fn parse_date(raw: &str, year: i32) -> Option<NaiveDateTime> {
    if let Some(parsed) = try_parse(raw) {
        return Some(parsed);
    }

    // Posters mostly print "24.12." without a year
    let with_year = format!("{}{}", raw, year);
    if let Some(parsed) = try_parse(&with_year) {
        return Some(parsed);
    }

    if raw.ends_with(|c: char| c.is_ascii_digit()) {
        let with_separator = format!("{}.{}", raw, year);
        if let Some(parsed) = try_parse(&with_separator) {
            return Some(parsed);
        }
    }

    None
}

/// Last resort: month names, or a date followed by a time of day
/// ("24.07.2026 19:30", "2026-07-24 19 Uhr", "24. Juli 2026")
fn parse_loose(raw: &str, year: i32) -> Option<NaiveDateTime> {
    let english = english_month_names(raw);
    for format in MONTH_NAME_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(&english, format) {
            return date.and_hms_opt(0, 0, 0);
        }
    }

    let (head, tail) = raw.split_once(|c: char| c.is_whitespace() || c == ',')?;
    let date = parse_date(head.trim_end_matches(','), year)?;
    match parse_event_time(tail) {
        Some(time) => Some(date.date().and_time(time)),
        None => Some(date),
    }
}

fn english_month_names(raw: &str) -> String {
    raw.split_whitespace()
        .map(|word| {
            let name = word.trim_end_matches(['.', ',']);
            let suffix = &word[name.len()..];
            let lower = name.to_lowercase();
            GERMAN_MONTHS
                .iter()
                .find(|(german, _)| lower == *german)
                .map(|(_, english)| format!("{}{}", english, suffix))
                .unwrap_or_else(|| word.to_string())
        })
        .collect::<Vec<_>>()
        .join(" ")
}

fn try_parse(raw: &str) -> Option<NaiveDateTime> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(raw) {
        return Some(dt.naive_local());
    }

    for format in DATE_TIME_FORMATS {
        if let Ok(dt) = NaiveDateTime::parse_from_str(raw, format) {
            if dt.year() >= 1000 {
                return Some(dt);
            }
        }
    }

    for (format, four_digit_year) in DATE_FORMATS {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            // chrono accepts "26" for %Y; leave two digit years to %y
            if *four_digit_year && date.year() < 1000 {
                continue;
            }
            return date.and_hms_opt(0, 0, 0);
        }
    }

    None
}

fn clock_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b([01]?\d|2[0-3])[:.]([0-5]\d)\b").expect("valid clock regex")
    })
}

fn hour_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)\b([01]?\d|2[0-3])\s*(?:uhr|h)\b").expect("valid hour regex")
    })
}

/// Parse the first time of day in free text ("19:30", "19.30 Uhr", "20 Uhr")
pub fn parse_event_time(raw: &str) -> Option<NaiveTime> {
    if let Some(caps) = clock_regex().captures(raw) {
        let hour: u32 = caps[1].parse().ok()?;
        let minute: u32 = caps[2].parse().ok()?;
        return NaiveTime::from_hms_opt(hour, minute, 0);
    }

    if let Some(caps) = hour_regex().captures(raw) {
        let hour: u32 = caps[1].parse().ok()?;
        return NaiveTime::from_hms_opt(hour, 0, 0);
    }

    None
}
