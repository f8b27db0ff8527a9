//! Retention planning.
//!
//! Count-based retention alone can break incremental chains, so deletion
//! candidates are computed against a set of pinned basenames: snapshots
//! with live locks and snapshots serving as the incremental parent for
//! some destination. A pinned snapshot is never removable.

use std::collections::BTreeSet;

use crate::journal::LockJournal;

/// Basenames to delete from `present`, keeping the `keep` most recent plus
/// everything in `pinned`. `keep == 0` keeps all. Results come back in
/// ascending order, oldest first.
pub fn removable(
    present: &BTreeSet<String>,
    keep: usize,
    pinned: &BTreeSet<String>,
) -> Vec<String> {
    if keep == 0 {
        return Vec::new();
    }
    present
        .iter()
        .rev()
        .skip(keep)
        .filter(|name| !pinned.contains(*name))
        .rev()
        .cloned()
        .collect()
}

/// Source-side pins: every journal-locked snapshot, plus the newest
/// snapshot shared with each destination (the live incremental parent).
pub fn source_pins(
    source_set: &BTreeSet<String>,
    journal: &LockJournal,
    dest_sets: &[&BTreeSet<String>],
) -> BTreeSet<String> {
    let mut pinned = journal.locked_snapshots();
    for dest_set in dest_sets {
        if let Some(parent) = source_set.intersection(dest_set).last() {
            pinned.insert(parent.clone());
        }
    }
    pinned
}

/// Destination-side pins: the most recent snapshot present there, so the
/// next run always finds an incremental parent.
pub fn destination_pins(dest_set: &BTreeSet<String>) -> BTreeSet<String> {
    dest_set.iter().next_back().cloned().into_iter().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_keep_zero_keeps_all() {
        let present = set(&["20240101-000000", "20240102-000000"]);
        assert!(removable(&present, 0, &BTreeSet::new()).is_empty());
    }

    #[test]
    fn test_keep_count_removes_oldest_first() {
        let present = set(&[
            "20240101-000000",
            "20240102-000000",
            "20240103-000000",
            "20240104-000000",
        ]);
        assert_eq!(
            removable(&present, 2, &BTreeSet::new()),
            vec!["20240101-000000", "20240102-000000"]
        );
    }

    #[test]
    fn test_pinned_snapshot_survives_count() {
        // source A < B < C < D, keep 1, destination holds only B:
        // B is the live parent, D is retained by count, A and C go
        let present = set(&[
            "20240101-000000", // A
            "20240102-000000", // B
            "20240103-000000", // C
            "20240104-000000", // D
        ]);
        let dir = TempDir::new().unwrap();
        let journal = LockJournal::load(dir.path()).unwrap();
        let dest = set(&["20240102-000000"]);
        let pinned = source_pins(&present, &journal, &[&dest]);
        assert_eq!(pinned, set(&["20240102-000000"]));

        assert_eq!(
            removable(&present, 1, &pinned),
            vec!["20240101-000000", "20240103-000000"]
        );
    }

    #[test]
    fn test_locked_snapshots_are_pinned() {
        let present = set(&["20240101-000000", "20240102-000000", "20240103-000000"]);
        let dir = TempDir::new().unwrap();
        let mut journal = LockJournal::load(dir.path()).unwrap();
        journal.lock("20240101-000000", "ssh://nas/b").unwrap();

        let pinned = source_pins(&present, &journal, &[]);
        assert_eq!(
            removable(&present, 1, &pinned),
            vec!["20240102-000000"]
        );
    }

    #[test]
    fn test_destination_pins_newest() {
        let dest = set(&["20240101-000000", "20240103-000000"]);
        assert_eq!(destination_pins(&dest), set(&["20240103-000000"]));
        assert!(destination_pins(&BTreeSet::new()).is_empty());
    }

    #[test]
    fn test_destination_retention_keeps_newest() {
        let dest = set(&["20240101-000000", "20240102-000000", "20240103-000000"]);
        let pinned = destination_pins(&dest);
        assert_eq!(
            removable(&dest, 1, &pinned),
            vec!["20240101-000000", "20240102-000000"]
        );
    }

    #[test]
    fn test_fewer_than_keep_removes_nothing() {
        let present = set(&["20240101-000000"]);
        assert!(removable(&present, 3, &BTreeSet::new()).is_empty());
    }
}
