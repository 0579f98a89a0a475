use once_cell::sync::Lazy;
use regex_lite::Regex;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::value::{FieldMap, FieldValue};

/// Date fields where an empty string means "no date".
pub const EMPTY_AS_ABSENT_FIELDS: [&str; 3] = ["deadline", "cf_due_date", "cf_last_resolved"];

/// Fields reduced to a plain `YYYY-MM-DD` day.
pub const DAY_FIELDS: [&str; 2] = ["deadline", "cf_due_date"];

/// Fields carrying a full timestamp, stored as epoch milliseconds.
pub const TIMESTAMP_FIELDS: [&str; 1] = ["cf_last_resolved"];

static RELAXED_DATE: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^[0-9]{4}[/-][0-9]{2}[/-][0-9]{2}").ok());

static STRICT_TIMESTAMP: Lazy<Option<Regex>> = Lazy::new(|| {
    Regex::new(r"^[0-9]{4}[/-][0-9]{2}[/-][0-9]{2} [0-9]{2}:[0-9]{2}:[0-9]{2}.[0-9]{3}").ok()
});

/// `2012/03/04 anything` becomes `2012-03-04`; anything else is `None`.
#[must_use]
pub fn relaxed_day(value: &str) -> Option<String> {
    let pattern = RELAXED_DATE.as_ref()?;
    let matched = pattern.find(value)?;
    Some(matched.as_str().replace('/', "-"))
}

/// Outcome of reading a strict timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrictTimestamp {
    NotMatched,
    Millis(i64),
    Invalid,
}

/// `2012-03-04 05:06:07.089` becomes epoch milliseconds, read as UTC.
#[must_use]
pub fn strict_timestamp(value: &str) -> StrictTimestamp {
    let Some(pattern) = STRICT_TIMESTAMP.as_ref() else {
        return StrictTimestamp::NotMatched;
    };
    let Some(matched) = pattern.find(value) else {
        return StrictTimestamp::NotMatched;
    };
    match iso_instant(matched.as_str()).and_then(|iso| parse_millis(&iso)) {
        Some(millis) => StrictTimestamp::Millis(millis),
        None => StrictTimestamp::Invalid,
    }
}

fn iso_instant(matched: &str) -> Option<String> {
    let day = matched.get(..10)?.replace('/', "-");
    let clock = matched.get(11..19)?;
    let millis = matched.get(matched.len().checked_sub(3)?..)?;
    Some(format!("{day}T{clock}.{millis}Z"))
}

fn parse_millis(iso: &str) -> Option<i64> {
    let instant = OffsetDateTime::parse(iso, &Rfc3339).ok()?;
    i64::try_from(instant.unix_timestamp_nanos() / 1_000_000).ok()
}

/// Apply the date rules to one snapshot. Returns the timestamp values that
/// matched the strict pattern but are not real instants; they are left as
/// they were.
pub(crate) fn normalize_date_fields(fields: &mut FieldMap) -> Vec<(String, String)> {
    for field in EMPTY_AS_ABSENT_FIELDS {
        if let Some(value) = fields.get_mut(field) {
            if value.as_text() == Some("") {
                *value = FieldValue::Null;
            }
        }
    }

    for field in DAY_FIELDS {
        if let Some(value) = fields.get_mut(field) {
            if let Some(day) = value.as_text().and_then(relaxed_day) {
                *value = FieldValue::Text(day);
            }
        }
    }

    let mut invalid = Vec::new();
    for field in TIMESTAMP_FIELDS {
        let Some(value) = fields.get_mut(field) else {
            continue;
        };
        let Some(text) = value.as_text() else {
            continue;
        };
        match strict_timestamp(text) {
            StrictTimestamp::Millis(millis) => *value = FieldValue::Integer(millis),
            StrictTimestamp::Invalid => invalid.push((field.to_string(), text.to_string())),
            StrictTimestamp::NotMatched => {}
        }
    }
    invalid
}
