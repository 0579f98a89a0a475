use std::collections::BTreeSet;

use crate::HistoryError;

/// Unordered pairs of identity strings that name the same person, used to
/// match flag requestees across account renames. Immutable once built and
/// shared read-only between entities.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AliasTable {
    pairs: BTreeSet<(String, String)>,
}

impl AliasTable {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a comma separated list of `A=B` entries. Blank entries are
    /// skipped.
    ///
    /// # Errors
    /// Returns `HistoryError::Alias` when an entry has no `=` or an empty side.
    pub fn parse(list: &str) -> Result<Self, HistoryError> {
        let mut table = Self::new();
        for entry in list.split(',').map(str::trim).filter(|entry| !entry.is_empty()) {
            let Some((left, right)) = entry.split_once('=') else {
                return Err(HistoryError::Alias(format!("alias entry `{entry}` is missing `=`")));
            };
            table.insert(left, right)?;
        }
        Ok(table)
    }

    /// Register `left` and `right` as equivalent.
    ///
    /// # Errors
    /// Returns `HistoryError::Alias` when either side is empty after trimming.
    pub fn insert(&mut self, left: &str, right: &str) -> Result<(), HistoryError> {
        let (left, right) = (left.trim(), right.trim());
        if left.is_empty() || right.is_empty() {
            return Err(HistoryError::Alias(format!(
                "alias entry `{left}={right}` must name two identities"
            )));
        }
        self.pairs.insert(normalized_pair(left, right));
        Ok(())
    }

    #[must_use]
    pub fn are_aliases(&self, left: &str, right: &str) -> bool {
        !self.pairs.is_empty() && self.pairs.contains(&normalized_pair(left, right))
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

fn normalized_pair(left: &str, right: &str) -> (String, String) {
    if left <= right {
        (left.to_string(), right.to_string())
    } else {
        (right.to_string(), left.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pairs_match_in_both_directions() -> Result<(), HistoryError> {
        let table = AliasTable::parse("old@example.com=new@example.com, a=b")?;
        assert_eq!(table.len(), 2);
        assert!(table.are_aliases("old@example.com", "new@example.com"));
        assert!(table.are_aliases("new@example.com", "old@example.com"));
        assert!(table.are_aliases("b", "a"));
        assert!(!table.are_aliases("a", "new@example.com"));
        Ok(())
    }

    #[test]
    fn blank_list_is_empty() -> Result<(), HistoryError> {
        let table = AliasTable::parse(" , ")?;
        assert!(table.is_empty());
        assert!(!table.are_aliases("", ""));
        Ok(())
    }

    #[test]
    fn malformed_entries_are_rejected() {
        assert!(matches!(AliasTable::parse("a=b,c"), Err(HistoryError::Alias(_))));
        assert!(matches!(AliasTable::parse("=b"), Err(HistoryError::Alias(_))));
    }
}
