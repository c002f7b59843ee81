//! Backup integrity checking
//!
//! Verification re-reads a stored backup and checks it against its record:
//!
//! 1. **Record level**: the combined checksum still matches the list of
//!    directory checksums.
//! 2. **Archive level**: every directory archive exists and its SHA-256
//!    matches the record. The on-disk size is reported alongside; records
//!    carry no archive size to compare it with.
//!
//! Archives are hashed in parallel. Problems are reported in the
//! [`VerificationReport`], not as errors; an error is returned only when the
//! verification itself cannot run.
//!
//! ```rust,no_run
//! use dirvault::metadata::MetadataStore;
//! use dirvault::verification::RecordVerifier;
//!
//! # fn main() -> dirvault::Result<()> {
//! let store = MetadataStore::new("/backups/nightly");
//! let record = store.load("nightly-20240115-020000-000000")?;
//! let report = RecordVerifier::new(&store).verify(&record);
//! println!("{}", report.summary());
//! # Ok(())
//! # }
//! ```

use crate::metadata::MetadataStore;
use crate::record::{BackupRecord, DirectoryRecord};
use crate::utils;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Checks stored backups against their records
#[derive(Debug)]
pub struct RecordVerifier<'a> {
    store: &'a MetadataStore,
}

impl<'a> RecordVerifier<'a> {
    /// Verifier over the backups in `store`
    pub fn new(store: &'a MetadataStore) -> Self {
        Self { store }
    }

    /// Verify every archive of `record`
    pub fn verify(&self, record: &BackupRecord) -> VerificationReport {
        let start = Instant::now();
        let run_dir = self.store.run_dir(&record.id);

        let record_checksum_valid = record.verify_checksum();
        if !record_checksum_valid {
            warn!("Combined checksum of {} does not match its directories", record.id);
        }

        debug!("Verifying {} archives of {}", record.directories.len(), record.id);
        let directories: Vec<ArchiveVerification> = record
            .directories
            .par_iter()
            .map(|dir| verify_archive(dir, run_dir.join(dir.archive_file_name())))
            .collect();

        let report = VerificationReport {
            record_id: record.id.clone(),
            record_checksum_valid,
            directories,
            verification_time_ms: start.elapsed().as_millis() as u64,
        };

        info!("{}", report.summary());
        report
    }
}

fn verify_archive(dir: &DirectoryRecord, archive_path: PathBuf) -> ArchiveVerification {
    let mut check = ArchiveVerification {
        name: dir.name.clone(),
        archive_path,
        archive_exists: false,
        checksum_valid: false,
        actual_checksum: None,
        archive_size: 0,
        error: None,
    };

    match fs::metadata(&check.archive_path) {
        Ok(meta) if meta.is_file() => {
            check.archive_exists = true;
            check.archive_size = meta.len();
        }
        Ok(_) => {
            check.error = Some("archive path is not a file".to_string());
            return check;
        }
        Err(e) => {
            check.error = Some(format!("archive missing: {}", e));
            return check;
        }
    }

    match utils::hash_file_content(&check.archive_path) {
        Ok(actual) => {
            check.checksum_valid = actual == dir.checksum;
            check.actual_checksum = Some(actual);
        }
        Err(e) => check.error = Some(format!("failed to read archive: {}", e)),
    }
    check
}

/// Outcome of verifying one backup record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationReport {
    /// Backup record id
    pub record_id: String,
    /// Whether the combined checksum matches the directory checksums
    pub record_checksum_valid: bool,
    /// Per-directory results, in record order
    pub directories: Vec<ArchiveVerification>,
    /// Time taken in milliseconds
    pub verification_time_ms: u64,
}

impl VerificationReport {
    /// Whether the record and every archive check out
    pub fn is_valid(&self) -> bool {
        self.record_checksum_valid && self.directories.iter().all(ArchiveVerification::is_valid)
    }

    /// Number of valid archives
    pub fn valid_archives(&self) -> usize {
        self.directories.iter().filter(|d| d.is_valid()).count()
    }

    /// One-line summary
    pub fn summary(&self) -> String {
        if self.is_valid() {
            format!(
                "Backup {} is valid ({} archives verified in {}ms)",
                self.record_id,
                self.directories.len(),
                self.verification_time_ms
            )
        } else {
            let issues = [
                (!self.record_checksum_valid).then_some("combined checksum mismatch"),
                self.directories
                    .iter()
                    .any(|d| !d.archive_exists)
                    .then_some("missing archives"),
                self.directories
                    .iter()
                    .any(|d| d.archive_exists && !d.checksum_valid)
                    .then_some("archive checksum mismatch"),
            ]
            .into_iter()
            .flatten()
            .collect::<Vec<_>>()
            .join(", ");

            format!(
                "Backup {} is invalid: {} ({}/{} archives valid)",
                self.record_id,
                issues,
                self.valid_archives(),
                self.directories.len()
            )
        }
    }
}

/// Verification result for one directory archive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveVerification {
    /// Logical directory name
    pub name: String,
    /// Archive file checked
    pub archive_path: PathBuf,
    /// Whether the archive file exists
    pub archive_exists: bool,
    /// Whether its SHA-256 matches the record
    pub checksum_valid: bool,
    /// Checksum computed from disk
    pub actual_checksum: Option<String>,
    /// Size of the archive on disk
    pub archive_size: u64,
    /// Error message if the archive could not be checked
    pub error: Option<String>,
}

impl ArchiveVerification {
    /// Whether this archive passed
    pub fn is_valid(&self) -> bool {
        self.archive_exists && self.checksum_valid && self.error.is_none()
    }
}
