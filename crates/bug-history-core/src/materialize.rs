//! Forward replay.
//!
//! Starting from the created state found by the backward pass, the activity
//! batches are re-applied oldest first. After each batch the snapshot is
//! canonicalized and copied out as one version whose validity ends where the
//! next batch begins.

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

use crate::activity::{ActivityBatch, FieldChange};
use crate::alias::AliasTable;
use crate::builder::Reconstruction;
use crate::config::ReplayConfig;
use crate::dates::normalize_date_fields;
use crate::diagnostics::{Diagnostic, DiagnosticKind, Diagnostics, Direction};
use crate::reconcile::FlagReconciler;
use crate::snapshot::{resolve_target, Attachment, BugState, EmittedVersion};
use crate::value::{is_multi_valued, split_multi_value, FieldValue};

const FLAGS_FIELD: &str = "flags";
const SORTED_LIST_FIELD: &str = "cc";

/// Every version emitted for one bug plus what went wrong along the way.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntityHistory {
    pub bug_id: i64,
    pub versions: Vec<EmittedVersion>,
    pub diagnostics: Vec<Diagnostic>,
}

pub struct VersionMaterializer<'a> {
    config: &'a ReplayConfig,
}

impl<'a> VersionMaterializer<'a> {
    #[must_use]
    pub fn new(config: &'a ReplayConfig) -> Self {
        Self { config }
    }

    pub(crate) fn replay(&self, reconstruction: Reconstruction) -> EntityHistory {
        let Reconstruction { mut state, mut attachments, batches, mut diagnostics, aliases } =
            reconstruction;
        let bug_id = state.bug_id;
        let mut replay = Replay {
            aliases: &aliases,
            diagnostics: &mut diagnostics,
            reported_dates: BTreeSet::new(),
        };

        // Newest first, so `pop` yields the oldest remaining batch.
        let mut remaining: Vec<ActivityBatch> = batches.into_values().rev().collect();
        // The bug's own creation, with no changes of its own.
        let mut next = Some(ActivityBatch::new(bug_id, state.modified_ts, &state.modified_by));

        let mut versions = Vec::new();
        let mut version_num = 1_u32;

        while let Some(current) = next.take() {
            next = remaining.pop();
            let merging = next.as_ref().is_some_and(|pending| pending.id == current.id);

            state.expires_on = next.as_ref().map(|pending| pending.modified_ts);
            state.id.clone_from(&current.id);
            state.modified_ts = current.modified_ts;
            state.modified_by.clone_from(&current.modified_by);
            state.changes.clone_from(&current.changes);

            for change in &current.changes {
                replay.apply_change(&mut state, &mut attachments, change, &current);
            }

            canonicalize(&mut state);
            replay.normalize_dates(&mut state);
            state.bug_version_num = version_num;

            if merging {
                tracing::debug!(bug_id, version = %current.id, "merging coincident batch");
                continue;
            }
            version_num += 1;

            if self.config.emits(state.modified_ts, state.expires_on) {
                versions.push(EmittedVersion {
                    bug_id,
                    version_id: state.id.clone(),
                    document: state.document(&attachments),
                });
            } else {
                tracing::trace!(bug_id, version = %current.id, "version before start_time");
            }
        }

        EntityHistory { bug_id, versions, diagnostics: diagnostics.into_entries() }
    }
}

struct Replay<'r> {
    aliases: &'r AliasTable,
    diagnostics: &'r mut Diagnostics,
    reported_dates: BTreeSet<(String, String)>,
}

impl Replay<'_> {
    fn apply_change(
        &mut self,
        state: &mut BugState,
        attachments: &mut BTreeMap<String, Attachment>,
        change: &FieldChange,
        batch: &ActivityBatch,
    ) {
        let ts = batch.modified_ts;
        let field_name = change.field_name.as_str();

        if change.is_attachment_added() {
            let attach_id = change.attach_id.as_deref().unwrap_or(change.field_value.as_str());
            if !attachments.contains_key(attach_id) {
                self.missing_attachment(ts, field_name, attach_id);
            } else if !state.attachment_ids.iter().any(|existing| existing == attach_id) {
                state.attachment_ids.push(attach_id.to_string());
            }
            return;
        }

        let attach_id = change.attach_id.as_deref();
        let (target, missing) = resolve_target(state, attachments, attach_id);
        if missing {
            self.missing_attachment(ts, field_name, attach_id.unwrap_or_default());
        }

        if !is_multi_valued(field_name) {
            let incoming = FieldValue::scalar(field_name, &change.field_value);
            let current = target.fields().get(field_name).cloned().unwrap_or_default();
            if current != incoming {
                target.record_previous(field_name, current, ts);
            }
            target.fields_mut().insert(field_name.to_string(), incoming);
            return;
        }

        if field_name == FLAGS_FIELD {
            let outcome = FlagReconciler::new(self.aliases).apply(
                target.flags_mut(),
                &change.field_value,
                &change.field_value_removed,
                ts,
                &batch.modified_by,
            );
            tracing::trace!(
                removed = outcome.removed,
                adopted = outcome.adopted,
                appended = outcome.appended,
                "flags reconciled"
            );
            for issue in outcome.issues {
                self.diagnostics.report(ts, field_name, issue);
            }
            return;
        }

        let fields = target.fields_mut();
        match fields.get_mut(field_name) {
            Some(FieldValue::List(values)) => {
                for value in split_multi_value(&change.field_value_removed) {
                    match values.iter().position(|existing| *existing == value) {
                        Some(index) => {
                            values.remove(index);
                        }
                        None => self.value_not_found(ts, field_name, value),
                    }
                }
                values.extend(split_multi_value(&change.field_value));
            }
            None | Some(FieldValue::Null) => {
                fields.insert(field_name.to_string(), FieldValue::list(&change.field_value));
            }
            Some(other) => *other = FieldValue::scalar(field_name, &change.field_value),
        }
    }

    fn normalize_dates(&mut self, state: &mut BugState) {
        for (field_name, value) in normalize_date_fields(&mut state.fields) {
            if self.reported_dates.insert((field_name.clone(), value.clone())) {
                self.diagnostics.report(
                    state.modified_ts,
                    &field_name,
                    DiagnosticKind::UnparseableDate { value },
                );
            }
        }
    }

    fn missing_attachment(&mut self, ts: i64, field_name: &str, attach_id: &str) {
        self.diagnostics.report(
            ts,
            field_name,
            DiagnosticKind::MissingAttachment { attach_id: attach_id.to_string() },
        );
    }

    fn value_not_found(&mut self, ts: i64, field_name: &str, value: String) {
        let kind = DiagnosticKind::ValueNotFound { value, direction: Direction::Removed };
        if field_name == SORTED_LIST_FIELD {
            self.diagnostics.notice(ts, field_name, kind);
        } else {
            self.diagnostics.report(ts, field_name, kind);
        }
    }
}

/// Sort order-irrelevant lists and the change log so identical history always
/// serializes identically.
fn canonicalize(state: &mut BugState) {
    if let Some(FieldValue::List(values)) = state.fields.get_mut(SORTED_LIST_FIELD) {
        if values.first().is_some_and(|first| !first.is_empty()) {
            values.sort();
        }
    }
    state.changes.sort_by(|left, right| left.field_name.cmp(&right.field_name));
}
