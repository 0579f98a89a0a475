use serde::{Deserialize, Serialize};

/// Field name of the synthetic change that places a new attachment into the
/// snapshot during the forward replay.
pub const ATTACHMENT_ADDED: &str = "attachment_added";

/// One added/removed pair as recorded in the change log, kept raw so the
/// forward replay can interpret it exactly as the backward pass did.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldChange {
    pub field_name: String,
    #[serde(default)]
    pub field_value: String,
    #[serde(default)]
    pub field_value_removed: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attach_id: Option<String>,
}

impl FieldChange {
    #[must_use]
    pub fn new(field_name: &str, added: &str, removed: &str, attach_id: Option<&str>) -> Self {
        Self {
            field_name: field_name.to_string(),
            field_value: added.to_string(),
            field_value_removed: removed.to_string(),
            attach_id: attach_id.map(str::to_string),
        }
    }

    #[must_use]
    pub fn attachment_added(attach_id: &str) -> Self {
        Self::new(ATTACHMENT_ADDED, attach_id, "", Some(attach_id))
    }

    #[must_use]
    pub fn is_attachment_added(&self) -> bool {
        self.field_name == ATTACHMENT_ADDED
    }
}

/// Identity of the version that starts at `modified_ts`.
#[must_use]
pub fn version_id(bug_id: i64, modified_ts: i64) -> String {
    format!("{bug_id}.{modified_ts}")
}

/// All changes made to one bug at one instant, in arrival order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivityBatch {
    pub id: String,
    pub modified_ts: i64,
    pub modified_by: String,
    pub changes: Vec<FieldChange>,
}

impl ActivityBatch {
    #[must_use]
    pub fn new(bug_id: i64, modified_ts: i64, modified_by: &str) -> Self {
        Self {
            id: version_id(bug_id, modified_ts),
            modified_ts,
            modified_by: modified_by.to_string(),
            changes: Vec::new(),
        }
    }

    pub(crate) fn announces_attachment(&self, attach_id: &str) -> bool {
        self.changes
            .iter()
            .any(|change| change.is_attachment_added() && change.field_value == attach_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_identity_is_bug_and_timestamp() {
        let batch = ActivityBatch::new(100, 2000, "dev@example.com");
        assert_eq!(batch.id, "100.2000");
        assert!(batch.changes.is_empty());
    }

    #[test]
    fn attachment_announcement_is_detected() {
        let mut batch = ActivityBatch::new(1, 1, "");
        batch.changes.push(FieldChange::new("status", "NEW", "", None));
        assert!(!batch.announces_attachment("7"));
        batch.changes.push(FieldChange::attachment_added("7"));
        assert!(batch.announces_attachment("7"));
        assert!(!batch.announces_attachment("8"));
    }
}
