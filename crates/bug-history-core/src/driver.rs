use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::builder::SnapshotBuilder;
use crate::config::ReplayConfig;
use crate::event::ChangeEvent;
use crate::materialize::EntityHistory;

/// Running totals for one replay.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ReplayStats {
    pub events_processed: usize,
    pub events_after_end_time: usize,
    pub sentinel_events: usize,
    pub entities: usize,
    pub versions_emitted: usize,
    pub diagnostics: usize,
    /// Largest event timestamp seen, used as the next incremental start.
    pub high_water_ts: Option<i64>,
}

/// Splits a sorted event stream into bugs and replays each one as soon as
/// the next bug starts.
///
/// Input must be ordered by [`crate::sort_for_delivery`]; the order is not
/// checked and out-of-order input yields wrong histories.
#[derive(Debug)]
pub struct HistoryReplayer {
    config: ReplayConfig,
    active: Option<SnapshotBuilder>,
    last_bug_id: Option<i64>,
    stats: ReplayStats,
}

impl HistoryReplayer {
    #[must_use]
    pub fn new(config: ReplayConfig) -> Self {
        Self { config, active: None, last_bug_id: None, stats: ReplayStats::default() }
    }

    #[must_use]
    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    #[must_use]
    pub fn stats(&self) -> ReplayStats {
        self.stats
    }

    /// Feed one event. Returns the finished history of the previous bug when
    /// this event starts a new one.
    pub fn push(&mut self, event: &ChangeEvent) -> Option<EntityHistory> {
        if !self.config.accepts_event(event.modified_ts) {
            self.stats.events_after_end_time += 1;
            return None;
        }
        self.stats.events_processed += 1;

        let starts_bug = match self.last_bug_id {
            Some(last) => event.bug_id > last,
            None => true,
        };
        let mut finished = None;
        if starts_bug {
            finished = self.finish_active();
            self.last_bug_id = Some(event.bug_id);
            if !event.is_sentinel() {
                let aliases = Arc::clone(self.config.aliases());
                self.active = Some(SnapshotBuilder::start(event, aliases));
            }
        }

        if event.is_sentinel() {
            self.stats.sentinel_events += 1;
            return finished;
        }
        self.stats.high_water_ts = self.stats.high_water_ts.max(Some(event.modified_ts));
        if let Some(builder) = self.active.as_mut() {
            builder.apply(event);
        }
        finished
    }

    /// Flush the last bug once the stream is exhausted.
    pub fn finish(&mut self) -> Option<EntityHistory> {
        self.finish_active()
    }

    fn finish_active(&mut self) -> Option<EntityHistory> {
        let builder = self.active.take()?;
        let history = builder.materialize(&self.config);
        self.stats.entities += 1;
        self.stats.versions_emitted += history.versions.len();
        self.stats.diagnostics += history.diagnostics.len();
        tracing::debug!(
            bug_id = history.bug_id,
            versions = history.versions.len(),
            diagnostics = history.diagnostics.len(),
            "bug replayed"
        );
        Some(history)
    }
}

/// Replay a whole, already ordered event stream.
pub fn replay_events<'e, I>(config: ReplayConfig, events: I) -> (Vec<EntityHistory>, ReplayStats)
where
    I: IntoIterator<Item = &'e ChangeEvent>,
{
    let mut replayer = HistoryReplayer::new(config);
    let mut histories = Vec::new();
    for event in events {
        histories.extend(replayer.push(event));
    }
    histories.extend(replayer.finish());
    (histories, replayer.stats())
}
