use std::cmp::{Ordering, Reverse};

use serde::{Deserialize, Deserializer, Serialize};

/// Entity ids at or above this value mark placeholder rows. They still close
/// the previous entity but are otherwise ignored.
pub const SENTINEL_BUG_ID: i64 = 999_999_999;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum EventClass {
    CurrentScalar,
    CurrentMultiValued,
    CurrentAttachment,
    CurrentFlag,
    HistoricalDiff,
}

impl EventClass {
    #[must_use]
    pub fn code(self) -> i64 {
        match self {
            Self::CurrentScalar => 1,
            Self::CurrentMultiValued => 2,
            Self::CurrentAttachment => 7,
            Self::CurrentFlag => 8,
            Self::HistoricalDiff => 9,
        }
    }

    #[must_use]
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            1 => Some(Self::CurrentScalar),
            2 => Some(Self::CurrentMultiValued),
            7 => Some(Self::CurrentAttachment),
            8 => Some(Self::CurrentFlag),
            9 => Some(Self::HistoricalDiff),
            _ => None,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CurrentScalar => "current_scalar",
            Self::CurrentMultiValued => "current_multi_valued",
            Self::CurrentAttachment => "current_attachment",
            Self::CurrentFlag => "current_flag",
            Self::HistoricalDiff => "historical_diff",
        }
    }
}

/// One row of the change log.
///
/// `attach_id` is empty when the row is not scoped to an attachment. The
/// raw `event_class` code is kept so unknown classes survive deserialization
/// and can be reported instead of failing the whole input.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChangeEvent {
    #[serde(alias = "entity_id")]
    pub bug_id: i64,
    pub modified_ts: i64,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub modified_by: String,
    pub field_name: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub field_value: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub field_value_removed: String,
    #[serde(default, alias = "sub_entity_id", deserialize_with = "null_as_empty")]
    pub attach_id: String,
    pub event_class: i64,
}

impl ChangeEvent {
    #[must_use]
    pub fn class(&self) -> Option<EventClass> {
        EventClass::from_code(self.event_class)
    }

    #[must_use]
    pub fn attachment(&self) -> Option<&str> {
        if self.attach_id.is_empty() {
            None
        } else {
            Some(self.attach_id.as_str())
        }
    }

    #[must_use]
    pub fn is_sentinel(&self) -> bool {
        self.bug_id >= SENTINEL_BUG_ID
    }
}

fn null_as_empty<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

/// Ordering the replay driver expects: ascending entity, then event class
/// (current-state rows before historical diffs), then newest diff first.
/// Rows that tie on all three keep their arrival order.
#[must_use]
pub fn delivery_cmp(left: &ChangeEvent, right: &ChangeEvent) -> Ordering {
    delivery_key(left).cmp(&delivery_key(right))
}

fn delivery_key(event: &ChangeEvent) -> (i64, i64, Reverse<i64>) {
    let diff_ts = if event.class() == Some(EventClass::HistoricalDiff) {
        event.modified_ts
    } else {
        0
    };
    (event.bug_id, event.event_class, Reverse(diff_ts))
}

/// Stable sort into delivery order, for callers that read events from an
/// unordered source such as a flat file.
pub fn sort_for_delivery(events: &mut [ChangeEvent]) {
    events.sort_by(delivery_cmp);
}
