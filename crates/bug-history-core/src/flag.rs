use once_cell::sync::Lazy;
use regex_lite::Regex;
use serde::{Deserialize, Serialize};

use crate::alias::AliasTable;

pub(crate) const MILLIS_PER_DAY: i64 = 86_400_000;

static FLAG_PATTERN: Lazy<Option<Regex>> =
    Lazy::new(|| Regex::new(r"^(.*)([?+-])(\([^)]*\))?$").ok());

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum FlagStatus {
    #[serde(rename = "?")]
    Requested,
    #[serde(rename = "+")]
    Granted,
    #[serde(rename = "-")]
    Denied,
    /// Set on a flag whose value was removed and not yet re-added.
    #[serde(rename = "D")]
    Deleted,
}

impl FlagStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "?",
            Self::Granted => "+",
            Self::Denied => "-",
            Self::Deleted => "D",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "?" => Some(Self::Requested),
            "+" => Some(Self::Granted),
            "-" => Some(Self::Denied),
            "D" => Some(Self::Deleted),
            _ => None,
        }
    }
}

/// A request or approval marker such as `review?(dev@example.com)`, plus the
/// bookkeeping accumulated while its history is replayed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Flag {
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_status: Option<FlagStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requestee: Option<String>,
    pub modified_ts: i64,
    pub modified_by: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_status: Option<FlagStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_modified_ts: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_modified_by: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_days: Option<i64>,
}

impl Flag {
    /// Parse a flag string. Strings outside the flag grammar are kept as an
    /// opaque value with no type or status.
    #[must_use]
    pub fn parse(value: &str, modified_ts: i64, modified_by: &str) -> Self {
        let mut flag = Self {
            value: value.to_string(),
            request_type: None,
            request_status: None,
            requestee: None,
            modified_ts,
            modified_by: modified_by.to_string(),
            previous_status: None,
            previous_value: None,
            previous_modified_ts: None,
            previous_modified_by: None,
            duration_days: None,
        };

        let Some(pattern) = FLAG_PATTERN.as_ref() else {
            return flag;
        };
        let Some(captures) = pattern.captures(value) else {
            return flag;
        };

        flag.request_type = captures.get(1).map(|m| m.as_str().to_string());
        flag.request_status = captures.get(2).and_then(|m| FlagStatus::parse(m.as_str()));
        flag.requestee = captures
            .get(3)
            .map(|m| m.as_str())
            .filter(|group| group.len() > 2)
            .map(|group| group[1..group.len() - 1].to_string());
        flag
    }

    /// A flag whose value was removed and is waiting for a matching addition.
    #[must_use]
    pub fn is_dangling(&self) -> bool {
        self.value.is_empty()
    }

    /// Turn a live flag into a dangling one as of `modified_ts`.
    pub(crate) fn mark_removed(&mut self, removed: &Flag, modified_ts: i64, modified_by: &str) {
        let previous_ts = self.modified_ts;
        self.previous_modified_ts = Some(previous_ts);
        if self.modified_by != modified_by {
            self.previous_modified_by = Some(std::mem::replace(
                &mut self.modified_by,
                modified_by.to_string(),
            ));
        }
        self.modified_ts = modified_ts;
        self.previous_status = removed.request_status;
        self.previous_value = Some(removed.value.clone());
        self.request_status = Some(FlagStatus::Deleted);
        self.value.clear();
        self.duration_days =
            Some(modified_ts.saturating_sub(previous_ts).div_euclid(MILLIS_PER_DAY));
    }

    /// Re-activate a dangling flag with the parts of `added` that are set.
    pub(crate) fn adopt(&mut self, added: &Flag) {
        if !added.value.is_empty() {
            self.value.clone_from(&added.value);
        }
        if added.request_status.is_some() {
            self.request_status = added.request_status;
        }
        if added.requestee.is_some() {
            self.requestee.clone_from(&added.requestee);
        }
    }
}

/// Render the flag grammar `type status [ (requestee) ]`.
#[must_use]
pub fn format_flag(request_type: &str, status: FlagStatus, requestee: Option<&str>) -> String {
    match requestee {
        Some(requestee) if !requestee.is_empty() => {
            format!("{request_type}{}({requestee})", status.as_str())
        }
        _ => format!("{request_type}{}", status.as_str()),
    }
}

/// Locate `wanted` in `flags`: an exact value match first, otherwise the
/// first flag with the same type and status whose requestee is an alias of
/// the wanted requestee.
#[must_use]
pub fn find_flag(flags: &[Flag], wanted: &Flag, aliases: &AliasTable) -> Option<usize> {
    if let Some(index) = flags.iter().position(|flag| flag.value == wanted.value) {
        return Some(index);
    }
    let wanted_requestee = wanted.requestee.as_deref()?;
    flags.iter().position(|flag| {
        flag.request_type == wanted.request_type
            && flag.request_status == wanted.request_status
            && flag
                .requestee
                .as_deref()
                .is_some_and(|requestee| aliases.are_aliases(requestee, wanted_requestee))
    })
}
