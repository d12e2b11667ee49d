// 🔀 Delta Engine - Set-based membership comparison
//
// Compares the identifier sets of two consecutive snapshots and splits them
// into added / removed / retained. Pure set arithmetic, no side effects:
//   added    = current − baseline
//   removed  = baseline − current
//   retained = baseline ∩ current

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

// ============================================================================
// DELTA
// ============================================================================

/// Membership changes between a baseline snapshot and a current snapshot.
///
/// Invariants (upheld by construction in [`DeltaEngine::compare`]):
/// - `added` and `removed` are disjoint
/// - `retained ∪ removed` = baseline ids
/// - `retained ∪ added` = current ids
///
/// Ephemeral: computed per run, never persisted directly. Its derived
/// metrics record is what lands in the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    /// Present in current, absent in baseline
    pub added: HashSet<String>,

    /// Present in baseline, absent in current
    pub removed: HashSet<String>,

    /// Present in both snapshots
    pub retained: HashSet<String>,
}

impl Delta {
    pub fn added_count(&self) -> usize {
        self.added.len()
    }

    pub fn removed_count(&self) -> usize {
        self.removed.len()
    }

    pub fn retained_count(&self) -> usize {
        self.retained.len()
    }

    /// Joined − left; may be negative
    pub fn net_change(&self) -> i64 {
        self.added.len() as i64 - self.removed.len() as i64
    }

    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.removed.is_empty()
    }

    /// Added ids in stable sorted order, for human-readable change lists
    pub fn sorted_added(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.added.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Removed ids in stable sorted order
    pub fn sorted_removed(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.removed.iter().cloned().collect();
        ids.sort();
        ids
    }
}

// ============================================================================
// DELTA ENGINE
// ============================================================================

/// Computes the membership delta between two identifier sets.
pub struct DeltaEngine;

impl DeltaEngine {
    /// Compare baseline against current.
    ///
    /// Either set may be empty. An empty baseline is the bootstrap case:
    /// everything current counts as added, nothing is removed or retained.
    /// O(|baseline| + |current|) with hash-set membership tests.
    pub fn compare(baseline_ids: &HashSet<String>, current_ids: &HashSet<String>) -> Delta {
        let added = current_ids
            .difference(baseline_ids)
            .cloned()
            .collect::<HashSet<String>>();

        let removed = baseline_ids
            .difference(current_ids)
            .cloned()
            .collect::<HashSet<String>>();

        let retained = baseline_ids
            .intersection(current_ids)
            .cloned()
            .collect::<HashSet<String>>();

        log::debug!(
            "Delta: {} added, {} removed, {} retained",
            added.len(),
            removed.len(),
            retained.len()
        );

        Delta {
            added,
            removed,
            retained,
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(values: &[&str]) -> HashSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_compare_basic_scenario() {
        // baseline {A,B,C} vs current {B,C,D,E}
        let delta = DeltaEngine::compare(&ids(&["A", "B", "C"]), &ids(&["B", "C", "D", "E"]));

        assert_eq!(delta.added, ids(&["D", "E"]));
        assert_eq!(delta.removed, ids(&["A"]));
        assert_eq!(delta.retained, ids(&["B", "C"]));
        assert_eq!(delta.net_change(), 1);
    }

    #[test]
    fn test_added_and_removed_are_disjoint() {
        let delta = DeltaEngine::compare(&ids(&["A", "B", "C"]), &ids(&["B", "C", "D", "E"]));

        assert!(delta.added.is_disjoint(&delta.removed));
    }

    #[test]
    fn test_partition_covers_both_sets() {
        let baseline = ids(&["A", "B", "C", "D"]);
        let current = ids(&["C", "D", "E"]);
        let delta = DeltaEngine::compare(&baseline, &current);

        // retained + removed reconstructs the baseline
        assert_eq!(delta.retained_count() + delta.removed_count(), baseline.len());
        // retained + added reconstructs the current set
        assert_eq!(delta.retained_count() + delta.added_count(), current.len());
    }

    #[test]
    fn test_empty_baseline_is_bootstrap() {
        let current = ids(&["S001", "S002", "S003"]);
        let delta = DeltaEngine::compare(&HashSet::new(), &current);

        assert_eq!(delta.added, current);
        assert!(delta.removed.is_empty());
        assert!(delta.retained.is_empty());
    }

    #[test]
    fn test_empty_current_drops_everyone() {
        let baseline = ids(&["S001", "S002"]);
        let delta = DeltaEngine::compare(&baseline, &HashSet::new());

        assert!(delta.added.is_empty());
        assert_eq!(delta.removed, baseline);
        assert_eq!(delta.net_change(), -2);
    }

    #[test]
    fn test_identical_snapshots_have_no_changes() {
        let members = ids(&["S001", "S002", "S003"]);
        let delta = DeltaEngine::compare(&members, &members);

        assert!(!delta.has_changes());
        assert_eq!(delta.retained, members);
    }

    #[test]
    fn test_sorted_change_lists() {
        let delta = DeltaEngine::compare(&ids(&["Z"]), &ids(&["C", "A", "B"]));

        assert_eq!(delta.sorted_added(), vec!["A", "B", "C"]);
        assert_eq!(delta.sorted_removed(), vec!["Z"]);
    }
}
