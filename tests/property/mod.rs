//! Property-based testing for dirvault
//!
//! Uses proptest to check the archive round trip, checksum stability and
//! retention decisions over randomly generated trees and record sets.

use ::dirvault::*;
use chrono::{DateTime, Duration, TimeZone, Utc};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Relative file paths; directory and file names never collide
fn path_strategy() -> impl Strategy<Value = PathBuf> {
    (
        prop::collection::vec("d[a-z]{1,4}", 0..=3),
        "f[a-z0-9]{1,6}\\.(txt|bin)",
    )
        .prop_map(|(dirs, file)| {
            let mut path: PathBuf = dirs.into_iter().collect();
            path.push(file);
            path
        })
}

fn content_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        Just(Vec::new()),
        prop::collection::vec(any::<u8>(), 1..512),
        prop::collection::vec(Just(b'z'), 1024..8192),
    ]
}

fn tree_strategy() -> impl Strategy<Value = BTreeMap<PathBuf, Vec<u8>>> {
    prop::collection::btree_map(path_strategy(), content_strategy(), 0..12)
}

fn materialize(root: &Path, tree: &BTreeMap<PathBuf, Vec<u8>>) {
    for (path, content) in tree {
        let full = root.join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(full, content).unwrap();
    }
}

fn base_time() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap()
}

/// Records whose timestamps are `base_time() - offset` hours
fn records_at(offsets: &[i64]) -> Vec<BackupRecord> {
    offsets
        .iter()
        .enumerate()
        .map(|(i, hours)| {
            let ts = base_time() - Duration::hours(*hours);
            BackupRecord::new("prop", format!("prop-{:03}-{}", i, ts.timestamp()), ts, vec![])
        })
        .collect()
}

fn policy_strategy() -> impl Strategy<Value = RetentionPolicy> {
    (0u32..60, 0usize..20, 0u32..3).prop_map(|(keep_days, keep_count, keep_monthly)| RetentionPolicy {
        keep_days,
        keep_count,
        keep_monthly,
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_archive_restore_round_trip(tree in tree_strategy(), compress in any::<bool>()) {
        let source = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        let target = TempDir::new().unwrap();
        materialize(source.path(), &tree);

        let cancel = CancellationToken::new();
        let entry = DirectoryEntry::new(source.path(), "tree").compressed(compress);
        let output = Archiver::new().archive(&entry, out.path(), &cancel).unwrap();
        prop_assert_eq!(output.record.file_count, tree.len());
        prop_assert_eq!(output.record.size, tree.values().map(|c| c.len() as u64).sum::<u64>());

        Restorer::new()
            .restore(&output.record, &output.archive_path, target.path(), &cancel)
            .unwrap();
        for (path, content) in &tree {
            prop_assert_eq!(&fs::read(target.path().join(path)).unwrap(), content);
        }
    }

    #[test]
    fn prop_checksum_matches_archive_bytes(tree in tree_strategy(), compress in any::<bool>()) {
        let source = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        materialize(source.path(), &tree);

        let entry = DirectoryEntry::new(source.path(), "tree").compressed(compress);
        let output = Archiver::new().archive(&entry, out.path(), &CancellationToken::new()).unwrap();
        let on_disk = utils::hash_file_content(&output.archive_path).unwrap();
        prop_assert_eq!(output.record.checksum, on_disk);
    }

    #[test]
    fn prop_retention_is_deterministic(
        offsets in prop::collection::vec(0i64..24 * 120, 0..30),
        policy in policy_strategy(),
    ) {
        let records = records_at(&offsets);
        let first = retention::evaluate(&records, &policy, base_time());
        let mut reversed = records.clone();
        reversed.reverse();
        let second = retention::evaluate(&reversed, &policy, base_time());
        prop_assert_eq!(first, second);
    }

    #[test]
    fn prop_retention_is_idempotent(
        offsets in prop::collection::vec(0i64..24 * 120, 0..30),
        policy in policy_strategy(),
    ) {
        let records = records_at(&offsets);
        let doomed = retention::evaluate(&records, &policy, base_time());
        let survivors: Vec<BackupRecord> = records
            .into_iter()
            .filter(|r| !doomed.contains(&r.id))
            .collect();
        prop_assert!(retention::evaluate(&survivors, &policy, base_time()).is_empty());
    }

    #[test]
    fn prop_count_rule_keeps_newest(
        offsets in prop::collection::vec(0i64..10_000, 1..40),
        keep_count in 1usize..15,
    ) {
        let records = records_at(&offsets);
        let policy = RetentionPolicy { keep_count, ..Default::default() };
        let doomed = retention::evaluate(&records, &policy, base_time());
        prop_assert_eq!(doomed.len(), records.len().saturating_sub(keep_count));

        let newest_doomed = records.iter().filter(|r| doomed.contains(&r.id)).map(|r| r.timestamp).max();
        let oldest_kept = records.iter().filter(|r| !doomed.contains(&r.id)).map(|r| r.timestamp).min();
        if let (Some(doomed_ts), Some(kept_ts)) = (newest_doomed, oldest_kept) {
            prop_assert!(doomed_ts <= kept_ts);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_count_rule_fifteen_keep_ten() {
        let offsets: Vec<i64> = (0..15).collect();
        let records = records_at(&offsets);
        let policy = RetentionPolicy { keep_count: 10, ..Default::default() };

        let doomed = retention::evaluate(&records, &policy, base_time());
        let expected: std::collections::BTreeSet<String> = records[10..].iter().map(|r| r.id.clone()).collect();
        assert_eq!(doomed, expected);
    }

    #[test]
    fn test_age_rule() {
        let records = records_at(&[5 * 24, 40 * 24, 100 * 24]);
        let policy = RetentionPolicy { keep_days: 30, ..Default::default() };

        let doomed = retention::evaluate(&records, &policy, base_time());
        assert_eq!(doomed.len(), 2);
        assert!(!doomed.contains(&records[0].id));
    }

    #[test]
    fn test_monthly_rule_keeps_latest_of_month() {
        let stamps = [
            Utc.with_ymd_and_hms(2024, 1, 3, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 17, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 1, 29, 0, 0, 0).unwrap(),
            Utc.with_ymd_and_hms(2024, 2, 2, 0, 0, 0).unwrap(),
        ];
        let records: Vec<BackupRecord> = stamps
            .iter()
            .enumerate()
            .map(|(i, ts)| BackupRecord::new("prop", format!("prop-{i}"), *ts, vec![]))
            .collect();
        let policy = RetentionPolicy { keep_monthly: 1, ..Default::default() };

        let doomed = retention::evaluate(&records, &policy, base_time());
        let expected: std::collections::BTreeSet<String> =
            ["prop-0".to_string(), "prop-1".to_string()].into_iter().collect();
        assert_eq!(doomed, expected);
    }

    #[test]
    fn test_inactive_policy_keeps_everything() {
        let records = records_at(&[1, 1000, 100_000]);
        assert!(retention::evaluate(&records, &RetentionPolicy::default(), base_time()).is_empty());
    }
}
