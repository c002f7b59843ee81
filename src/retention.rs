//! Retention policy evaluation
//!
//! [`evaluate`] is a pure function over a job's records: it returns the ids
//! that the active [`RetentionPolicy`] no longer keeps. [`prune`] applies
//! that decision to a [`MetadataStore`].
//!
//! ## Rules
//!
//! Each rule is evaluated on its own and the results are unioned. A zero
//! value disables the rule.
//!
//! 1. **Age** (`keep_days`): records older than `keep_days * 24h` are marked.
//! 2. **Count** (`keep_count`): records are ordered newest first, ties broken
//!    by id (descending); everything after the first `keep_count` is marked.
//! 3. **Monthly** (`keep_monthly`): within each calendar month (UTC) only
//!    the newest record survives this rule. Any positive value enables it;
//!    the number itself is not a per-month quota.
//!
//! ```rust
//! use dirvault::retention::evaluate;
//! use dirvault::types::RetentionPolicy;
//! # use dirvault::record::BackupRecord;
//! # use chrono::{Duration, Utc};
//! # let now = Utc::now();
//! # let records: Vec<BackupRecord> = (0..15)
//! #     .map(|i| BackupRecord::new("job", format!("job-{i:02}"), now - Duration::hours(i), vec![]))
//! #     .collect();
//! let policy = RetentionPolicy { keep_count: 10, ..Default::default() };
//! let doomed = evaluate(&records, &policy, now);
//! assert_eq!(doomed.len(), 5);
//! ```

use crate::error::VaultError;
use crate::metadata::MetadataStore;
use crate::record::BackupRecord;
use crate::types::RetentionPolicy;
use chrono::{DateTime, Duration, Utc};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, info, warn};

/// Ids of the records the policy no longer keeps
pub fn evaluate(records: &[BackupRecord], policy: &RetentionPolicy, now: DateTime<Utc>) -> BTreeSet<String> {
    let mut marked = BTreeSet::new();

    if policy.keep_days > 0 {
        let cutoff = Duration::hours(24 * i64::from(policy.keep_days));
        marked.extend(
            records
                .iter()
                .filter(|r| now.signed_duration_since(r.timestamp) > cutoff)
                .map(|r| r.id.clone()),
        );
    }

    if policy.keep_count > 0 && records.len() > policy.keep_count {
        let mut ordered: Vec<&BackupRecord> = records.iter().collect();
        ordered.sort_by(|a, b| newest_first(a, b));
        marked.extend(ordered[policy.keep_count..].iter().map(|r| r.id.clone()));
    }

    if policy.keep_monthly > 0 {
        let mut months: BTreeMap<String, Vec<&BackupRecord>> = BTreeMap::new();
        for record in records {
            months
                .entry(record.timestamp.format("%Y-%m").to_string())
                .or_default()
                .push(record);
        }
        for group in months.values_mut().filter(|g| g.len() > 1) {
            group.sort_by(|a, b| newest_first(a, b));
            marked.extend(group[1..].iter().map(|r| r.id.clone()));
        }
    }

    marked
}

fn newest_first(a: &BackupRecord, b: &BackupRecord) -> Ordering {
    b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id))
}

/// Result of a pruning pass
#[derive(Debug, Clone, Default)]
pub struct PruneReport {
    /// Ids that were deleted
    pub deleted: Vec<String>,
    /// Ids that could not be deleted, with the reason
    pub failures: Vec<(String, String)>,
}

/// Delete every record of `records` that `policy` marks
///
/// Deletion failures are logged and collected; they never stop the pass.
pub fn prune(
    store: &MetadataStore,
    records: &[BackupRecord],
    policy: &RetentionPolicy,
    now: DateTime<Utc>,
) -> PruneReport {
    let mut report = PruneReport::default();
    if !policy.is_active() {
        return report;
    }

    let doomed = evaluate(records, policy, now);
    debug!("Retention marked {} of {} records", doomed.len(), records.len());

    for id in doomed {
        match store.delete(&id) {
            Ok(()) => report.deleted.push(id),
            Err(e) => {
                let reason = match &e {
                    VaultError::RetentionDeletion { source, .. } => source.to_string(),
                    other => other.to_string(),
                };
                warn!("Retention could not delete backup {}: {}", id, reason);
                report.failures.push((id, reason));
            }
        }
    }

    if !report.deleted.is_empty() {
        info!("Pruned {} backups", report.deleted.len());
    }
    report
}
