//! Bug history reconstruction.
//!
//! A bug tracker stores each bug as its current state plus a log of field
//! diffs. This crate folds the diffs backwards to recover the bug as it was
//! created, then replays them forwards to emit one immutable document per
//! change with a `[modified_ts, expires_on)` validity interval.

mod activity;
mod alias;
mod builder;
mod config;
mod dates;
mod diagnostics;
mod driver;
mod event;
mod flag;
mod materialize;
mod reconcile;
mod snapshot;
mod value;

pub use activity::{version_id, ActivityBatch, FieldChange, ATTACHMENT_ADDED};
pub use alias::AliasTable;
pub use builder::{SnapshotBuilder, UNCERTAIN_FIELD};
pub use config::{ReplayConfig, ReplaySettings, DEFAULT_LOOK_BACK_MS};
pub use dates::{relaxed_day, strict_timestamp, StrictTimestamp};
pub use diagnostics::{Diagnostic, DiagnosticKind, Direction, Severity};
pub use driver::{replay_events, HistoryReplayer, ReplayStats};
pub use event::{delivery_cmp, sort_for_delivery, ChangeEvent, EventClass, SENTINEL_BUG_ID};
pub use flag::{find_flag, format_flag, Flag, FlagStatus};
pub use materialize::{EntityHistory, VersionMaterializer};
pub use snapshot::{
    Attachment, BugDocument, EmittedVersion, PreviousValue, PreviousValues,
    ATTACHMENT_RESERVED_FIELDS, BUG_RESERVED_FIELDS,
};
pub use value::{
    is_multi_valued, is_truncated, split_multi_value, FieldMap, FieldValue, MULTI_VALUED_FIELDS,
    TRUNCATED_FIELDS,
};

#[derive(Debug, Clone, thiserror::Error, Eq, PartialEq)]
pub enum HistoryError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("alias error: {0}")]
    Alias(String),
}
