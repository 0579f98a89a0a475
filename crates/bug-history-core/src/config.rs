use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::alias::AliasTable;
use crate::HistoryError;

/// Default overlap for incremental runs, so rows committed just before the
/// previous run finished are not missed.
pub const DEFAULT_LOOK_BACK_MS: i64 = 5 * 60 * 1000;

/// Replay options as written in a settings file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct ReplaySettings {
    #[serde(default)]
    pub start_time: i64,
    #[serde(default)]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub alias_list: String,
    #[serde(default)]
    pub look_back_ms: Option<i64>,
}

/// Validated replay window plus the alias table shared by every entity.
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    start_time: i64,
    end_time: Option<i64>,
    aliases: Arc<AliasTable>,
}

impl ReplayConfig {
    /// # Errors
    /// Returns `HistoryError::Config` when `end_time` precedes `start_time`.
    pub fn new(
        start_time: i64,
        end_time: Option<i64>,
        aliases: Arc<AliasTable>,
    ) -> Result<Self, HistoryError> {
        if let Some(end_time) = end_time {
            if end_time < start_time {
                return Err(HistoryError::Config(format!(
                    "end_time {end_time} is before start_time {start_time}"
                )));
            }
        }
        Ok(Self { start_time, end_time, aliases })
    }

    /// # Errors
    /// Returns an error when the alias list is malformed or the window is
    /// inverted.
    pub fn from_settings(settings: &ReplaySettings) -> Result<Self, HistoryError> {
        let aliases = AliasTable::parse(&settings.alias_list)?;
        Self::new(settings.start_time, settings.end_time, Arc::new(aliases))
    }

    #[must_use]
    pub fn start_time(&self) -> i64 {
        self.start_time
    }

    #[must_use]
    pub fn end_time(&self) -> Option<i64> {
        self.end_time
    }

    #[must_use]
    pub fn aliases(&self) -> &Arc<AliasTable> {
        &self.aliases
    }

    /// Events after `end_time` are discarded before they reach a bug.
    #[must_use]
    pub fn accepts_event(&self, modified_ts: i64) -> bool {
        match self.end_time {
            Some(end_time) => modified_ts <= end_time,
            None => true,
        }
    }

    /// A version is emitted when it starts or ends inside the window.
    #[must_use]
    pub fn emits(&self, modified_ts: i64, expires_on: Option<i64>) -> bool {
        modified_ts >= self.start_time
            || expires_on.is_some_and(|expires_on| expires_on >= self.start_time)
    }
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self { start_time: 0, end_time: None, aliases: Arc::new(AliasTable::new()) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_emits_versions_touching_start() -> Result<(), HistoryError> {
        let config = ReplayConfig::new(1_000, None, Arc::new(AliasTable::new()))?;
        assert!(config.emits(1_000, None));
        assert!(config.emits(10, Some(1_000)));
        assert!(!config.emits(10, Some(999)));
        assert!(!config.emits(10, None));
        Ok(())
    }

    #[test]
    fn end_time_filters_later_events() -> Result<(), HistoryError> {
        let config = ReplayConfig::new(0, Some(50), Arc::new(AliasTable::new()))?;
        assert!(config.accepts_event(50));
        assert!(!config.accepts_event(51));
        assert!(ReplayConfig::default().accepts_event(i64::MAX));
        Ok(())
    }

    #[test]
    fn inverted_window_is_rejected() {
        let result = ReplayConfig::new(10, Some(5), Arc::new(AliasTable::new()));
        assert!(matches!(result, Err(HistoryError::Config(_))));
    }

    #[test]
    fn settings_build_aliases() -> Result<(), HistoryError> {
        let settings = ReplaySettings {
            start_time: 5,
            end_time: Some(9),
            alias_list: "a@x=b@x".to_string(),
            look_back_ms: None,
        };
        let config = ReplayConfig::from_settings(&settings)?;
        assert_eq!(config.start_time(), 5);
        assert_eq!(config.end_time(), Some(9));
        assert!(config.aliases().are_aliases("b@x", "a@x"));
        Ok(())
    }

    #[test]
    fn settings_parse_from_json() -> Result<(), serde_json::Error> {
        let settings: ReplaySettings =
            serde_json::from_str(r#"{"start_time": 7, "alias_list": "p=q"}"#)?;
        assert_eq!(settings.start_time, 7);
        assert_eq!(settings.end_time, None);
        assert_eq!(settings.alias_list, "p=q");
        Ok(())
    }
}
