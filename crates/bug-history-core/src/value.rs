use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Fields whose values are comma separated sets rather than single values.
pub const MULTI_VALUED_FIELDS: [&str; 9] = [
    "flags", "cc", "keywords", "dependson", "blocked", "dupe_by", "dupe_of", "bug_group",
    "see_also",
];

/// Fields whose historical values were truncated by the source system.
pub const TRUNCATED_FIELDS: [&str; 4] = ["cc", "blocked", "dependson", "keywords"];

pub type FieldMap = BTreeMap<String, FieldValue>;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum FieldValue {
    #[default]
    Null,
    Integer(i64),
    Text(String),
    List(Vec<String>),
}

impl FieldValue {
    /// Build the stored form of a single raw value. Fields named `*_ts` hold
    /// epoch milliseconds and are kept as integers when they parse.
    #[must_use]
    pub fn scalar(field_name: &str, raw: &str) -> Self {
        if field_name.ends_with("_ts") {
            if let Ok(parsed) = raw.trim().parse::<i64>() {
                return Self::Integer(parsed);
            }
        }
        Self::Text(raw.to_string())
    }

    #[must_use]
    pub fn list(raw: &str) -> Self {
        Self::List(split_multi_value(raw))
    }

    #[must_use]
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(value) => Some(*value),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(value) => Some(value.as_str()),
            _ => None,
        }
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }
}

#[must_use]
pub fn is_multi_valued(field_name: &str) -> bool {
    MULTI_VALUED_FIELDS.contains(&field_name)
}

#[must_use]
pub fn is_truncated(field_name: &str) -> bool {
    TRUNCATED_FIELDS.contains(&field_name)
}

/// Split a diff column into its entries. Entries are trimmed and empty
/// entries dropped, so `""` yields nothing.
#[must_use]
pub fn split_multi_value(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(str::to_string)
        .collect()
}
