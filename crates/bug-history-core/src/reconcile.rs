//! Flag lifecycle reconciliation for the forward replay.
//!
//! A removal does not delete a flag: it leaves a dangling record behind
//! (empty value, status `D`) so that a later addition of the same flag type
//! can pick it up and keep its history.

use crate::alias::AliasTable;
use crate::diagnostics::{DiagnosticKind, Direction};
use crate::flag::{find_flag, Flag};
use crate::value::split_multi_value;

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub(crate) struct Reconciliation {
    pub(crate) removed: usize,
    pub(crate) adopted: usize,
    pub(crate) appended: usize,
    pub(crate) issues: Vec<DiagnosticKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Choice {
    New,
    Adopt(usize),
    Unresolved(usize),
}

pub(crate) struct FlagReconciler<'a> {
    aliases: &'a AliasTable,
}

impl<'a> FlagReconciler<'a> {
    pub(crate) fn new(aliases: &'a AliasTable) -> Self {
        Self { aliases }
    }

    /// Apply one `flags` change: every removal first, then every addition.
    pub(crate) fn apply(
        &self,
        flags: &mut Vec<Flag>,
        added: &str,
        removed: &str,
        modified_ts: i64,
        modified_by: &str,
    ) -> Reconciliation {
        let mut outcome = Reconciliation::default();

        for value in split_multi_value(removed) {
            let wanted = Flag::parse(&value, modified_ts, modified_by);
            match find_flag(flags, &wanted, self.aliases) {
                Some(index) => {
                    flags[index].mark_removed(&wanted, modified_ts, modified_by);
                    outcome.removed += 1;
                }
                None => outcome
                    .issues
                    .push(DiagnosticKind::FlagNotFound { value, direction: Direction::Removed }),
            }
        }

        for value in split_multi_value(added) {
            let flag = Flag::parse(&value, modified_ts, modified_by);
            match choose(flags, &flag) {
                Choice::New => {
                    flags.push(flag);
                    outcome.appended += 1;
                }
                Choice::Adopt(index) => {
                    flags[index].adopt(&flag);
                    outcome.adopted += 1;
                }
                Choice::Unresolved(candidates) => {
                    tracing::debug!(value = %value, candidates, "dropping ambiguous flag addition");
                    outcome
                        .issues
                        .push(DiagnosticKind::FlagMatchUnresolved { value, candidates });
                }
            }
        }

        outcome
    }
}

/// Pick the dangling flag an addition continues. Ties are broken by an
/// identical timestamp, then by the author being the flag's requestee.
fn choose(flags: &[Flag], added: &Flag) -> Choice {
    let candidates: Vec<usize> = flags
        .iter()
        .enumerate()
        .filter(|(_, flag)| {
            flag.is_dangling()
                && flag.request_type == added.request_type
                && flag.previous_status != added.request_status
        })
        .map(|(index, _)| index)
        .collect();

    match candidates.as_slice() {
        [] => return Choice::New,
        [only] => return Choice::Adopt(*only),
        _ => {}
    }

    let same_time: Vec<usize> = candidates
        .iter()
        .copied()
        .filter(|&index| flags[index].modified_ts == added.modified_ts)
        .collect();
    if let [only] = same_time.as_slice() {
        return Choice::Adopt(*only);
    }

    let author = added.modified_by.to_lowercase();
    let by_requestee: Vec<usize> = candidates
        .iter()
        .copied()
        .filter(|&index| {
            flags[index]
                .requestee
                .as_deref()
                .is_some_and(|requestee| requestee.to_lowercase() == author)
        })
        .collect();
    if let [only] = by_requestee.as_slice() {
        return Choice::Adopt(*only);
    }

    Choice::Unresolved(candidates.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flag::{FlagStatus, MILLIS_PER_DAY};

    fn live(value: &str, ts: i64, by: &str) -> Flag {
        Flag::parse(value, ts, by)
    }

    #[test]
    fn removal_then_readdition_adopts_the_dangling_flag() {
        let aliases = AliasTable::new();
        let reconciler = FlagReconciler::new(&aliases);
        let mut flags = vec![live("review?(dev@x)", 0, "lead@x")];

        let outcome = reconciler.apply(
            &mut flags,
            "review+(dev@x)",
            "review?(dev@x)",
            2 * MILLIS_PER_DAY + 5,
            "dev@x",
        );

        assert_eq!((outcome.removed, outcome.adopted, outcome.appended), (1, 1, 0));
        assert!(outcome.issues.is_empty());
        assert_eq!(flags.len(), 1);
        assert_eq!(flags[0].value, "review+(dev@x)");
        assert_eq!(flags[0].request_status, Some(FlagStatus::Granted));
        assert_eq!(flags[0].previous_status, Some(FlagStatus::Requested));
        assert_eq!(flags[0].previous_modified_by.as_deref(), Some("lead@x"));
        assert_eq!(flags[0].duration_days, Some(2));
    }

    #[test]
    fn addition_without_candidates_appends() {
        let aliases = AliasTable::new();
        let reconciler = FlagReconciler::new(&aliases);
        let mut flags = Vec::new();
        let outcome = reconciler.apply(&mut flags, "needinfo?(a@x), review?", "", 10, "b@x");
        assert_eq!(outcome.appended, 2);
        assert_eq!(flags.len(), 2);
        assert_eq!(flags[1].value, "review?");
        assert_eq!(flags[1].modified_ts, 10);
    }

    #[test]
    fn same_status_dangling_flag_is_not_a_candidate() {
        let aliases = AliasTable::new();
        let reconciler = FlagReconciler::new(&aliases);
        let mut flags = vec![live("review?(a@x)", 0, "a@x")];
        reconciler.apply(&mut flags, "", "review?(a@x)", 5, "a@x");
        let outcome = reconciler.apply(&mut flags, "review?(b@x)", "", 6, "a@x");
        assert_eq!(outcome.appended, 1);
        assert_eq!(flags.len(), 2);
        assert!(flags[0].is_dangling());
    }

    #[test]
    fn unknown_removal_is_reported_and_ignored() {
        let aliases = AliasTable::new();
        let reconciler = FlagReconciler::new(&aliases);
        let mut flags = vec![live("review?(a@x)", 0, "a@x")];
        let outcome = reconciler.apply(&mut flags, "", "superreview?(a@x)", 5, "a@x");
        assert_eq!(
            outcome.issues,
            vec![DiagnosticKind::FlagNotFound {
                value: "superreview?(a@x)".to_string(),
                direction: Direction::Removed,
            }]
        );
        assert_eq!(flags[0].value, "review?(a@x)");
    }

    #[test]
    fn removal_matches_through_aliases() -> Result<(), crate::HistoryError> {
        let aliases = AliasTable::parse("old@x=new@x")?;
        let reconciler = FlagReconciler::new(&aliases);
        let mut flags = vec![live("review?(old@x)", 0, "a@x")];
        let outcome = reconciler.apply(&mut flags, "", "review?(new@x)", 5, "a@x");
        assert_eq!(outcome.removed, 1);
        assert!(flags[0].is_dangling());
        assert_eq!(flags[0].previous_value.as_deref(), Some("review?(new@x)"));
        Ok(())
    }

    #[test]
    fn ambiguity_is_broken_by_timestamp() {
        let aliases = AliasTable::new();
        let reconciler = FlagReconciler::new(&aliases);
        let mut flags = vec![live("review?(a@x)", 0, "z@x"), live("review?(b@x)", 0, "z@x")];
        reconciler.apply(&mut flags, "", "review?(a@x)", 10, "z@x");
        reconciler.apply(&mut flags, "", "review?(b@x)", 20, "z@x");

        let outcome = reconciler.apply(&mut flags, "review+", "", 20, "c@x");
        assert_eq!(outcome.adopted, 1);
        assert_eq!(flags[1].value, "review+");
        assert!(flags[0].is_dangling());
    }

    #[test]
    fn ambiguity_is_broken_by_requestee() {
        let aliases = AliasTable::new();
        let reconciler = FlagReconciler::new(&aliases);
        let mut flags = vec![live("review?(a@x)", 0, "z@x"), live("review?(B@X)", 0, "z@x")];
        reconciler.apply(&mut flags, "", "review?(a@x), review?(B@X)", 10, "z@x");

        let outcome = reconciler.apply(&mut flags, "review+", "", 30, "b@x");
        assert_eq!(outcome.adopted, 1);
        assert_eq!(flags[1].value, "review+");
        assert_eq!(flags[1].requestee.as_deref(), Some("B@X"));
        assert!(flags[0].is_dangling());
    }

    #[test]
    fn unresolved_ambiguity_drops_the_addition() {
        let aliases = AliasTable::new();
        let reconciler = FlagReconciler::new(&aliases);
        let mut flags = vec![live("review?(a@x)", 0, "z@x"), live("review?(b@x)", 0, "z@x")];
        reconciler.apply(&mut flags, "", "review?(a@x), review?(b@x)", 10, "z@x");
        let before = flags.clone();

        let outcome = reconciler.apply(&mut flags, "review+", "", 30, "c@x");
        assert_eq!((outcome.adopted, outcome.appended), (0, 0));
        assert_eq!(
            outcome.issues,
            vec![DiagnosticKind::FlagMatchUnresolved { value: "review+".to_string(), candidates: 2 }]
        );
        assert_eq!(flags, before);
    }
}
