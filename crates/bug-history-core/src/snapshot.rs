use std::collections::BTreeMap;

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::activity::{version_id, FieldChange};
use crate::flag::{Flag, MILLIS_PER_DAY};
use crate::value::{FieldMap, FieldValue};

/// Names that belong to snapshot metadata and can never be set as fields.
pub const BUG_RESERVED_FIELDS: [&str; 10] = [
    "_id",
    "bug_id",
    "modified_ts",
    "modified_by",
    "expires_on",
    "bug_version_num",
    "attachments",
    "flags",
    "previous_values",
    "changes",
];

pub const ATTACHMENT_RESERVED_FIELDS: [&str; 5] =
    ["attach_id", "modified_ts", "modified_by", "flags", "previous_values"];

/// The value a field held before its latest change and how long it held it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviousValue {
    pub value: FieldValue,
    pub change_to_ts: Option<i64>,
    pub change_away_ts: i64,
    pub duration_days: Option<i64>,
}

/// Serializes flat, as `{field}_value`, `{field}_change_to_ts`,
/// `{field}_change_away_ts` and `{field}_duration_days`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PreviousValues {
    entries: BTreeMap<String, PreviousValue>,
}

impl PreviousValues {
    #[must_use]
    pub fn get(&self, field_name: &str) -> Option<&PreviousValue> {
        self.entries.get(field_name)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn record(
        &mut self,
        field_name: &str,
        value: FieldValue,
        created_ts: Option<i64>,
        change_away_ts: i64,
    ) {
        let change_to_ts = match self.entries.get(field_name) {
            Some(previous) => Some(previous.change_away_ts),
            None => created_ts,
        };
        let duration_days = change_to_ts
            .map(|since| change_away_ts.saturating_sub(since).div_euclid(MILLIS_PER_DAY));
        self.entries.insert(
            field_name.to_string(),
            PreviousValue { value, change_to_ts, change_away_ts, duration_days },
        );
    }
}

impl Serialize for PreviousValues {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len() * 4))?;
        for (field, entry) in &self.entries {
            map.serialize_entry(&format!("{field}_value"), &entry.value)?;
            map.serialize_entry(&format!("{field}_change_to_ts"), &entry.change_to_ts)?;
            map.serialize_entry(&format!("{field}_change_away_ts"), &entry.change_away_ts)?;
            map.serialize_entry(&format!("{field}_duration_days"), &entry.duration_days)?;
        }
        map.end()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Attachment {
    pub attach_id: String,
    pub modified_ts: i64,
    pub modified_by: String,
    #[serde(flatten)]
    pub fields: FieldMap,
    pub flags: Vec<Flag>,
    #[serde(skip_serializing_if = "PreviousValues::is_empty")]
    pub previous_values: PreviousValues,
}

impl Attachment {
    #[must_use]
    pub fn new(attach_id: &str, modified_ts: i64, modified_by: &str) -> Self {
        Self {
            attach_id: attach_id.to_string(),
            modified_ts,
            modified_by: modified_by.to_string(),
            fields: FieldMap::new(),
            flags: Vec::new(),
            previous_values: PreviousValues::default(),
        }
    }
}

/// An immutable copy of the bug as it stood during one validity interval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BugDocument {
    #[serde(rename = "_id")]
    pub id: String,
    pub bug_id: i64,
    pub modified_ts: i64,
    pub modified_by: String,
    pub expires_on: Option<i64>,
    pub bug_version_num: u32,
    #[serde(flatten)]
    pub fields: FieldMap,
    pub attachments: Vec<Attachment>,
    pub flags: Vec<Flag>,
    pub previous_values: PreviousValues,
    pub changes: Vec<FieldChange>,
}

impl BugDocument {
    #[must_use]
    pub fn field(&self, field_name: &str) -> Option<&FieldValue> {
        self.fields.get(field_name)
    }

    #[must_use]
    pub fn attachment(&self, attach_id: &str) -> Option<&Attachment> {
        self.attachments.iter().find(|attachment| attachment.attach_id == attach_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmittedVersion {
    pub bug_id: i64,
    pub version_id: String,
    pub document: BugDocument,
}

impl EmittedVersion {
    /// Serialize the document the way sinks store it.
    ///
    /// # Errors
    /// Returns an error when the document cannot be serialized.
    pub fn document_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(&self.document)
    }
}

/// The single mutable snapshot walked through a bug's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct BugState {
    pub(crate) id: String,
    pub(crate) bug_id: i64,
    pub(crate) modified_ts: i64,
    pub(crate) modified_by: String,
    pub(crate) expires_on: Option<i64>,
    pub(crate) bug_version_num: u32,
    pub(crate) fields: FieldMap,
    pub(crate) flags: Vec<Flag>,
    pub(crate) previous_values: PreviousValues,
    pub(crate) attachment_ids: Vec<String>,
    pub(crate) changes: Vec<FieldChange>,
}

impl BugState {
    pub(crate) fn start(bug_id: i64, modified_ts: i64, modified_by: &str) -> Self {
        let mut fields = FieldMap::new();
        fields.insert("reported_by".to_string(), FieldValue::Text(modified_by.to_string()));
        Self {
            id: version_id(bug_id, modified_ts),
            bug_id,
            modified_ts,
            modified_by: modified_by.to_string(),
            expires_on: None,
            bug_version_num: 0,
            fields,
            flags: Vec::new(),
            previous_values: PreviousValues::default(),
            attachment_ids: Vec::new(),
            changes: Vec::new(),
        }
    }

    pub(crate) fn document(&self, attachments: &BTreeMap<String, Attachment>) -> BugDocument {
        BugDocument {
            id: self.id.clone(),
            bug_id: self.bug_id,
            modified_ts: self.modified_ts,
            modified_by: self.modified_by.clone(),
            expires_on: self.expires_on,
            bug_version_num: self.bug_version_num,
            fields: self.fields.clone(),
            attachments: self
                .attachment_ids
                .iter()
                .filter_map(|attach_id| attachments.get(attach_id).cloned())
                .collect(),
            flags: self.flags.clone(),
            previous_values: self.previous_values.clone(),
            changes: self.changes.clone(),
        }
    }
}

/// Something a field change can land on: the bug or one of its attachments.
pub(crate) trait FieldTarget {
    fn fields(&self) -> &FieldMap;
    fn fields_mut(&mut self) -> &mut FieldMap;
    fn flags_mut(&mut self) -> &mut Vec<Flag>;
    fn previous_values_mut(&mut self) -> &mut PreviousValues;

    fn created_ts(&self) -> Option<i64> {
        self.fields().get("created_ts").and_then(FieldValue::as_integer)
    }

    fn record_previous(&mut self, field_name: &str, value: FieldValue, change_away_ts: i64) {
        let created_ts = self.created_ts();
        self.previous_values_mut().record(field_name, value, created_ts, change_away_ts);
    }
}

impl FieldTarget for BugState {
    fn fields(&self) -> &FieldMap {
        &self.fields
    }

    fn fields_mut(&mut self) -> &mut FieldMap {
        &mut self.fields
    }

    fn flags_mut(&mut self) -> &mut Vec<Flag> {
        &mut self.flags
    }

    fn previous_values_mut(&mut self) -> &mut PreviousValues {
        &mut self.previous_values
    }
}

impl FieldTarget for Attachment {
    fn fields(&self) -> &FieldMap {
        &self.fields
    }

    fn fields_mut(&mut self) -> &mut FieldMap {
        &mut self.fields
    }

    fn flags_mut(&mut self) -> &mut Vec<Flag> {
        &mut self.flags
    }

    fn previous_values_mut(&mut self) -> &mut PreviousValues {
        &mut self.previous_values
    }
}

/// Pick the target for a change. An unknown attachment falls back to the bug
/// and the second element is `true` so the caller can report it.
pub(crate) fn resolve_target<'a>(
    state: &'a mut BugState,
    attachments: &'a mut BTreeMap<String, Attachment>,
    attach_id: Option<&str>,
) -> (&'a mut dyn FieldTarget, bool) {
    if let Some(attach_id) = attach_id {
        if let Some(attachment) = attachments.get_mut(attach_id) {
            return (attachment, false);
        }
        return (state, true);
    }
    (state, false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_previous_value_starts_at_creation() {
        let mut previous = PreviousValues::default();
        previous.record("status", FieldValue::Text("NEW".to_string()), Some(0), MILLIS_PER_DAY * 3);
        previous.record("status", FieldValue::Text("ASSIGNED".to_string()), Some(0), MILLIS_PER_DAY * 4);

        let Some(entry) = previous.get("status") else {
            panic!("status history should be recorded");
        };
        assert_eq!(entry.value, FieldValue::Text("ASSIGNED".to_string()));
        assert_eq!(entry.change_to_ts, Some(MILLIS_PER_DAY * 3));
        assert_eq!(entry.change_away_ts, MILLIS_PER_DAY * 4);
        assert_eq!(entry.duration_days, Some(1));
    }

    #[test]
    fn previous_values_without_creation_time_have_no_duration() {
        let mut previous = PreviousValues::default();
        previous.record("priority", FieldValue::Null, None, 500);
        let Some(entry) = previous.get("priority") else {
            panic!("priority history should be recorded");
        };
        assert_eq!(entry.change_to_ts, None);
        assert_eq!(entry.duration_days, None);
    }

    #[test]
    fn previous_value_duration_saturates_on_extreme_timestamps() {
        let mut previous = PreviousValues::default();
        previous.record("status", FieldValue::Null, Some(i64::MIN), i64::MAX);
        let Some(entry) = previous.get("status") else {
            panic!("status history should be recorded");
        };
        assert_eq!(entry.duration_days, Some(i64::MAX.div_euclid(MILLIS_PER_DAY)));
    }

    #[test]
    fn previous_values_serialize_flat() -> Result<(), serde_json::Error> {
        let mut previous = PreviousValues::default();
        previous.record("status", FieldValue::Text("NEW".to_string()), Some(0), MILLIS_PER_DAY);
        assert_eq!(
            serde_json::to_string(&previous)?,
            r#"{"status_value":"NEW","status_change_to_ts":0,"status_change_away_ts":86400000,"status_duration_days":1}"#
        );
        Ok(())
    }

    #[test]
    fn document_keeps_attachment_insertion_order() -> Result<(), serde_json::Error> {
        let mut state = BugState::start(5, 100, "reporter@example.com");
        state.attachment_ids = vec!["20".to_string(), "10".to_string()];
        let mut attachments = BTreeMap::new();
        attachments.insert("10".to_string(), Attachment::new("10", 100, "a@x"));
        attachments.insert("20".to_string(), Attachment::new("20", 100, "a@x"));

        let document = state.document(&attachments);
        let ids: Vec<&str> = document.attachments.iter().map(|a| a.attach_id.as_str()).collect();
        assert_eq!(ids, vec!["20", "10"]);
        assert_eq!(
            document.field("reported_by"),
            Some(&FieldValue::Text("reporter@example.com".to_string()))
        );

        let json = serde_json::to_value(&document)?;
        assert_eq!(json["_id"], "5.100");
        assert_eq!(json["reported_by"], "reporter@example.com");
        assert!(json["expires_on"].is_null());
        Ok(())
    }

    #[test]
    fn unknown_attachment_resolves_to_bug() {
        let mut state = BugState::start(5, 100, "a@x");
        let mut attachments = BTreeMap::new();
        attachments.insert("10".to_string(), Attachment::new("10", 100, "a@x"));

        let (target, missing) = resolve_target(&mut state, &mut attachments, Some("99"));
        target.fields_mut().insert("status".to_string(), FieldValue::Text("NEW".to_string()));
        assert!(missing);
        assert!(state.fields.contains_key("status"));

        let (target, missing) = resolve_target(&mut state, &mut attachments, Some("10"));
        target.fields_mut().insert("ispatch".to_string(), FieldValue::Text("1".to_string()));
        assert!(!missing);
        assert!(attachments["10"].fields.contains_key("ispatch"));
    }
}
