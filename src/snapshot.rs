//! Snapshot naming and catalog math.
//!
//! A snapshot is identified by its basename, `<prefix>YYYYMMDD-HHMMSS`.
//! Within one prefix the lexicographic order of basenames equals their
//! temporal order, so sets of basenames can be compared directly to plan
//! incremental transfers.

use std::collections::BTreeSet;
use std::ops::Bound;

use chrono::NaiveDateTime;

/// Timestamp layout of a snapshot basename after the prefix.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

/// Basename for a snapshot taken right now on the local wall clock.
pub fn new_basename(prefix: &str) -> String {
    format!(
        "{}{}",
        prefix,
        chrono::Local::now().format(TIMESTAMP_FORMAT)
    )
}

/// Whether `name` is `<prefix>` followed by a valid timestamp.
pub fn is_snapshot_name(prefix: &str, name: &str) -> bool {
    name.strip_prefix(prefix)
        .map(|rest| NaiveDateTime::parse_from_str(rest, TIMESTAMP_FORMAT).is_ok())
        .unwrap_or(false)
}

/// Reduce a raw directory listing to the set of snapshot basenames
/// matching `prefix`. Anything else (dotfiles, foreign prefixes, names
/// with unparseable timestamps) is dropped.
pub fn filter_listing<I, S>(prefix: &str, names: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    names
        .into_iter()
        .filter(|n| is_snapshot_name(prefix, n.as_ref()))
        .map(|n| n.as_ref().to_string())
        .collect()
}

/// Pick the incremental parent for sending `basename`: the greatest member
/// of `common` strictly preceding it, or `None` for a full send.
pub fn find_parent<'a>(common: &'a BTreeSet<String>, basename: &str) -> Option<&'a str> {
    common
        .range::<str, _>((Bound::Unbounded, Bound::Excluded(basename)))
        .next_back()
        .map(String::as_str)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_is_snapshot_name() {
        assert!(is_snapshot_name("", "20240115-120000"));
        assert!(is_snapshot_name("home-", "home-20240115-120000"));
        assert!(!is_snapshot_name("home-", "20240115-120000"));
        assert!(!is_snapshot_name("", ".outstanding_transfers"));
        assert!(!is_snapshot_name("", "20241315-120000")); // month 13
        assert!(!is_snapshot_name("", "20240115-1200"));
        assert!(!is_snapshot_name("", "notasnapshot"));
    }

    #[test]
    fn test_new_basename_round_trips() {
        let name = new_basename("pre-");
        assert!(is_snapshot_name("pre-", &name));
    }

    #[test]
    fn test_filter_listing() {
        let names = vec![
            "20240115-120000",
            "20240116-120000",
            "home-20240117-120000",
            ".outstanding_transfers",
            "lost+found",
        ];
        assert_eq!(
            filter_listing("", names.clone()),
            set(&["20240115-120000", "20240116-120000"])
        );
        assert_eq!(
            filter_listing("home-", names),
            set(&["home-20240117-120000"])
        );
    }

    #[test]
    fn test_find_parent_prefers_greatest_older() {
        let common = set(&["20240101-000000", "20240102-000000", "20240104-000000"]);
        assert_eq!(
            find_parent(&common, "20240103-000000"),
            Some("20240102-000000")
        );
        assert_eq!(
            find_parent(&common, "20240105-000000"),
            Some("20240104-000000")
        );
    }

    #[test]
    fn test_find_parent_none_when_nothing_older() {
        let common = set(&["20240104-000000"]);
        assert_eq!(find_parent(&common, "20240103-000000"), None);
        assert_eq!(find_parent(&BTreeSet::new(), "20240103-000000"), None);
    }

    #[test]
    fn test_find_parent_excludes_self() {
        let common = set(&["20240103-000000"]);
        assert_eq!(find_parent(&common, "20240103-000000"), None);
    }
}
