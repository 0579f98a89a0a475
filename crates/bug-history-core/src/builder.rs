//! Backward pass.
//!
//! Current-state rows build the bug as it is today. Historical diffs arrive
//! newest first and are undone one by one, so once the last diff is folded
//! in the snapshot holds the bug as it was created. Every diff is also kept
//! in a per-timestamp activity batch for the forward replay.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::activity::{ActivityBatch, FieldChange};
use crate::alias::AliasTable;
use crate::config::ReplayConfig;
use crate::diagnostics::{DiagnosticKind, Diagnostics, Direction};
use crate::event::{ChangeEvent, EventClass};
use crate::flag::{find_flag, Flag};
use crate::materialize::{EntityHistory, VersionMaterializer};
use crate::snapshot::{
    resolve_target, Attachment, BugDocument, BugState, FieldTarget, ATTACHMENT_RESERVED_FIELDS,
    BUG_RESERVED_FIELDS,
};
use crate::value::{is_multi_valued, is_truncated, split_multi_value, FieldValue};

/// Field set on a bug whose history contains truncated values.
pub const UNCERTAIN_FIELD: &str = "uncertain";

const FLAGS_FIELD: &str = "flags";
const LEGACY_FLAGS_FIELD: &str = "flagtypes.name";
const UNKNOWN_VALUES: [&str; 2] = ["? ?", "?"];
const UNCERTAIN_PREFIX: &str = "? ";

/// Accumulates every event of one bug.
#[derive(Debug)]
pub struct SnapshotBuilder {
    state: BugState,
    attachments: BTreeMap<String, Attachment>,
    batches: BTreeMap<i64, ActivityBatch>,
    diagnostics: Diagnostics,
    aliases: Arc<AliasTable>,
}

/// Everything the forward replay needs from the backward pass.
#[derive(Debug)]
pub(crate) struct Reconstruction {
    pub(crate) state: BugState,
    pub(crate) attachments: BTreeMap<String, Attachment>,
    pub(crate) batches: BTreeMap<i64, ActivityBatch>,
    pub(crate) diagnostics: Diagnostics,
    pub(crate) aliases: Arc<AliasTable>,
}

impl SnapshotBuilder {
    /// Start a bug from its first event. The event itself is not applied;
    /// pass it to [`SnapshotBuilder::apply`] as well.
    #[must_use]
    pub fn start(first: &ChangeEvent, aliases: Arc<AliasTable>) -> Self {
        let mut diagnostics = Diagnostics::new(first.bug_id);
        if first.class() != Some(EventClass::CurrentScalar) {
            diagnostics.report(
                first.modified_ts,
                &first.field_name,
                DiagnosticKind::MissingCurrentRecord { first_event_class: first.event_class },
            );
        }
        tracing::trace!(bug_id = first.bug_id, "starting bug");
        Self {
            state: BugState::start(first.bug_id, first.modified_ts, &first.modified_by),
            attachments: BTreeMap::new(),
            batches: BTreeMap::new(),
            diagnostics,
            aliases,
        }
    }

    #[must_use]
    pub fn bug_id(&self) -> i64 {
        self.state.bug_id
    }

    /// Activity batches collected so far, oldest first.
    pub fn activity(&self) -> impl Iterator<Item = &ActivityBatch> {
        self.batches.values()
    }

    /// The snapshot as far as it has been folded: the current state before
    /// any diff, the created state after all of them.
    #[must_use]
    pub fn snapshot(&self) -> BugDocument {
        let mut state = self.state.clone();
        state.attachment_ids = self.attachments.keys().cloned().collect();
        state.document(&self.attachments)
    }

    pub fn apply(&mut self, event: &ChangeEvent) {
        let Some(class) = event.class() else {
            self.diagnostics.report(
                event.modified_ts,
                &event.field_name,
                DiagnosticKind::UnrecognizedEventClass { event_class: event.event_class },
            );
            return;
        };

        let field_name = if class == EventClass::HistoricalDiff
            && event.field_name == LEGACY_FLAGS_FIELD
        {
            FLAGS_FIELD
        } else {
            event.field_name.as_str()
        };

        if is_reserved(class, field_name, event.attachment().is_some()) {
            match row_metadata(event, class, field_name) {
                Some(own) if own == event.field_value => {}
                Some(_) => self.diagnostics.notice(
                    event.modified_ts,
                    field_name,
                    DiagnosticKind::ReservedField,
                ),
                None => self.diagnostics.report(
                    event.modified_ts,
                    field_name,
                    DiagnosticKind::ReservedField,
                ),
            }
            return;
        }

        let mut added = event.field_value.clone();
        let mut removed = event.field_value_removed.clone();
        if is_truncated(field_name) {
            let added_unknown = clear_unknown(&mut added);
            let removed_unknown = clear_unknown(&mut removed);
            if added_unknown || removed_unknown {
                tracing::debug!(
                    bug_id = event.bug_id,
                    field = field_name,
                    "truncated value; marking bug uncertain"
                );
                self.record_diff(
                    event.modified_ts,
                    &event.modified_by,
                    UNCERTAIN_FIELD,
                    "1",
                    "",
                    None,
                );
            }
            if added.is_empty() && removed.is_empty() {
                return;
            }
        }

        match class {
            EventClass::CurrentScalar => {
                self.state
                    .fields
                    .insert(field_name.to_string(), FieldValue::scalar(field_name, &added));
            }
            EventClass::CurrentMultiValued => self.append_current(event, field_name, added),
            EventClass::CurrentAttachment => self.apply_attachment(event, field_name, &added),
            EventClass::CurrentFlag => self.apply_current_flag(event, &added),
            EventClass::HistoricalDiff => self.record_diff(
                event.modified_ts,
                &event.modified_by,
                field_name,
                &added,
                &removed,
                event.attachment(),
            ),
        }
    }

    /// Hand the folded state to the forward replay.
    #[must_use]
    pub fn materialize(self, config: &ReplayConfig) -> EntityHistory {
        VersionMaterializer::new(config).replay(self.into_reconstruction())
    }

    pub(crate) fn into_reconstruction(self) -> Reconstruction {
        Reconstruction {
            state: self.state,
            attachments: self.attachments,
            batches: self.batches,
            diagnostics: self.diagnostics,
            aliases: self.aliases,
        }
    }

    fn append_current(&mut self, event: &ChangeEvent, field_name: &str, value: String) {
        if value.is_empty() {
            return;
        }
        match self.state.fields.get_mut(field_name) {
            Some(FieldValue::List(values)) => values.push(value),
            None | Some(FieldValue::Null) => {
                self.state.fields.insert(field_name.to_string(), FieldValue::List(vec![value]));
            }
            Some(_) => self.diagnostics.report(
                event.modified_ts,
                field_name,
                DiagnosticKind::MultiValueConflict,
            ),
        }
    }

    fn apply_attachment(&mut self, event: &ChangeEvent, field_name: &str, value: &str) {
        let Some(attach_id) = event.attachment() else {
            self.diagnostics.report(
                event.modified_ts,
                field_name,
                DiagnosticKind::MissingAttachmentId,
            );
            return;
        };

        let batch = self.batch(event.modified_ts, &event.modified_by);
        if !batch.announces_attachment(attach_id) {
            batch.changes.push(FieldChange::attachment_added(attach_id));
        }

        let attachment = self
            .attachments
            .entry(attach_id.to_string())
            .or_insert_with(|| Attachment::new(attach_id, event.modified_ts, &event.modified_by));
        attachment.fields.insert(field_name.to_string(), FieldValue::scalar(field_name, value));
    }

    fn apply_current_flag(&mut self, event: &ChangeEvent, value: &str) {
        let flag = Flag::parse(value, event.modified_ts, &event.modified_by);
        let (target, missing) =
            resolve_target(&mut self.state, &mut self.attachments, event.attachment());
        target.flags_mut().push(flag);
        if missing {
            self.report_missing_attachment(event.modified_ts, FLAGS_FIELD, event.attachment());
        }
    }

    /// Record a diff in its batch and undo it on the snapshot.
    fn record_diff(
        &mut self,
        modified_ts: i64,
        modified_by: &str,
        field_name: &str,
        added: &str,
        removed: &str,
        attach_id: Option<&str>,
    ) {
        let batch = self.batch(modified_ts, modified_by);
        let (batch_ts, batch_by) = (batch.modified_ts, batch.modified_by.clone());
        batch.changes.push(FieldChange::new(field_name, added, removed, attach_id));

        let aliases = Arc::clone(&self.aliases);
        let (target, missing) = resolve_target(&mut self.state, &mut self.attachments, attach_id);
        let mut issues = Vec::new();

        if field_name == FLAGS_FIELD {
            let flags = target.flags_mut();
            for value in split_multi_value(added) {
                let wanted = Flag::parse(&value, batch_ts, &batch_by);
                match find_flag(flags, &wanted, &aliases) {
                    Some(index) => {
                        flags.remove(index);
                    }
                    None => issues.push(DiagnosticKind::FlagNotFound {
                        value,
                        direction: Direction::Added,
                    }),
                }
            }
            for value in split_multi_value(removed) {
                flags.push(Flag::parse(&value, batch_ts, &batch_by));
            }
        } else {
            undo_field_change(target, field_name, added, removed, &mut issues);
        }

        if missing {
            self.report_missing_attachment(modified_ts, field_name, attach_id);
        }
        for issue in issues {
            if field_name == "cc" {
                self.diagnostics.notice(modified_ts, field_name, issue);
            } else {
                self.diagnostics.report(modified_ts, field_name, issue);
            }
        }
    }

    fn batch(&mut self, modified_ts: i64, modified_by: &str) -> &mut ActivityBatch {
        let bug_id = self.state.bug_id;
        self.batches
            .entry(modified_ts)
            .or_insert_with(|| ActivityBatch::new(bug_id, modified_ts, modified_by))
    }

    fn report_missing_attachment(&mut self, modified_ts: i64, field_name: &str, attach_id: Option<&str>) {
        self.diagnostics.report(
            modified_ts,
            field_name,
            DiagnosticKind::MissingAttachment {
                attach_id: attach_id.unwrap_or_default().to_string(),
            },
        );
    }
}

fn undo_field_change(
    target: &mut dyn FieldTarget,
    field_name: &str,
    added: &str,
    removed: &str,
    issues: &mut Vec<DiagnosticKind>,
) {
    let fields = target.fields_mut();
    if let Some(FieldValue::List(values)) = fields.get_mut(field_name) {
        for value in split_multi_value(added) {
            match values.iter().position(|existing| *existing == value) {
                Some(index) => {
                    values.remove(index);
                }
                None => issues.push(DiagnosticKind::ValueNotFound {
                    value,
                    direction: Direction::Added,
                }),
            }
        }
        values.extend(split_multi_value(removed));
        return;
    }

    let previous = if is_multi_valued(field_name) {
        FieldValue::list(removed)
    } else {
        FieldValue::scalar(field_name, removed)
    };
    fields.insert(field_name.to_string(), previous);
}

fn is_reserved(class: EventClass, field_name: &str, scoped_to_attachment: bool) -> bool {
    match class {
        EventClass::CurrentScalar | EventClass::CurrentMultiValued => {
            BUG_RESERVED_FIELDS.contains(&field_name)
        }
        EventClass::CurrentAttachment => ATTACHMENT_RESERVED_FIELDS.contains(&field_name),
        EventClass::CurrentFlag => false,
        EventClass::HistoricalDiff => {
            field_name != FLAGS_FIELD
                && (BUG_RESERVED_FIELDS.contains(&field_name)
                    || (scoped_to_attachment && ATTACHMENT_RESERVED_FIELDS.contains(&field_name)))
        }
    }
}

/// Current-state rows repeat their own identity columns as fields. Returns
/// the row's value for such a column.
fn row_metadata(event: &ChangeEvent, class: EventClass, field_name: &str) -> Option<String> {
    let scoped = match class {
        EventClass::CurrentScalar | EventClass::CurrentMultiValued => false,
        EventClass::CurrentAttachment => true,
        EventClass::CurrentFlag | EventClass::HistoricalDiff => return None,
    };
    match field_name {
        "bug_id" => Some(event.bug_id.to_string()),
        "modified_ts" => Some(event.modified_ts.to_string()),
        "modified_by" => Some(event.modified_by.clone()),
        "attach_id" if scoped => Some(event.attach_id.clone()),
        _ => None,
    }
}

/// Blank out an unknown-value marker or strip a truncation prefix. Returns
/// whether the value was unknown.
fn clear_unknown(value: &mut String) -> bool {
    if UNKNOWN_VALUES.contains(&value.as_str()) {
        value.clear();
        return true;
    }
    if let Some(stripped) = value.strip_prefix(UNCERTAIN_PREFIX) {
        *value = stripped.to_string();
    }
    false
}
