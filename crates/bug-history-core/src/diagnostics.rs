use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Expected noise from the source log, such as `cc` lists that were
    /// already out of sync upstream.
    Notice,
    Warning,
}

impl Severity {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Notice => "notice",
            Self::Warning => "warning",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Ord, PartialOrd, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Added,
    Removed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiagnosticKind {
    UnrecognizedEventClass { event_class: i64 },
    MissingCurrentRecord { first_event_class: i64 },
    MissingAttachmentId,
    MissingAttachment { attach_id: String },
    ReservedField,
    MultiValueConflict,
    ValueNotFound { value: String, direction: Direction },
    FlagNotFound { value: String, direction: Direction },
    FlagMatchUnresolved { value: String, candidates: usize },
    UnparseableDate { value: String },
}

impl DiagnosticKind {
    #[must_use]
    pub fn describe(&self) -> String {
        match self {
            Self::UnrecognizedEventClass { event_class } => {
                format!("event class {event_class} is not recognized; event dropped")
            }
            Self::MissingCurrentRecord { first_event_class } => format!(
                "first event has class {first_event_class}; no current-state record seen"
            ),
            Self::MissingAttachmentId => "attachment event has no attachment id".to_string(),
            Self::MissingAttachment { attach_id } => {
                format!("attachment {attach_id} is unknown; change applied to the bug")
            }
            Self::ReservedField => "field name is reserved for snapshot metadata".to_string(),
            Self::MultiValueConflict => {
                "cannot append to a field that holds a single value".to_string()
            }
            Self::ValueNotFound { value, direction } => {
                format!("{} value `{value}` not found", direction_label(*direction))
            }
            Self::FlagNotFound { value, direction } => {
                format!("{} flag `{value}` not found", direction_label(*direction))
            }
            Self::FlagMatchUnresolved { value, candidates } => format!(
                "added flag `{value}` matched {candidates} removed flags; addition dropped"
            ),
            Self::UnparseableDate { value } => format!("date `{value}` could not be parsed"),
        }
    }
}

fn direction_label(direction: Direction) -> &'static str {
    match direction {
        Direction::Added => "added",
        Direction::Removed => "removed",
    }
}

/// One recoverable problem met while reconstructing an entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Diagnostic {
    pub bug_id: i64,
    pub modified_ts: i64,
    pub field_name: String,
    pub severity: Severity,
    #[serde(flatten)]
    pub kind: DiagnosticKind,
}

impl Display for Diagnostic {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "bug {} at {} field `{}`: {}",
            self.bug_id,
            self.modified_ts,
            self.field_name,
            self.kind.describe()
        )
    }
}

/// Per-entity collector. Everything reported here is also written to the
/// tracing subscriber.
#[derive(Debug, Clone, Default)]
pub(crate) struct Diagnostics {
    bug_id: i64,
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub(crate) fn new(bug_id: i64) -> Self {
        Self { bug_id, entries: Vec::new() }
    }

    pub(crate) fn report(&mut self, modified_ts: i64, field_name: &str, kind: DiagnosticKind) {
        self.push(modified_ts, field_name, Severity::Warning, kind);
    }

    pub(crate) fn notice(&mut self, modified_ts: i64, field_name: &str, kind: DiagnosticKind) {
        self.push(modified_ts, field_name, Severity::Notice, kind);
    }

    fn push(&mut self, modified_ts: i64, field_name: &str, severity: Severity, kind: DiagnosticKind) {
        let diagnostic = Diagnostic {
            bug_id: self.bug_id,
            modified_ts,
            field_name: field_name.to_string(),
            severity,
            kind,
        };
        match severity {
            Severity::Warning => tracing::warn!(bug_id = self.bug_id, "{diagnostic}"),
            Severity::Notice => tracing::debug!(bug_id = self.bug_id, "{diagnostic}"),
        }
        self.entries.push(diagnostic);
    }

    pub(crate) fn into_entries(self) -> Vec<Diagnostic> {
        self.entries
    }
}
