//! Backup record persistence
//!
//! A [`MetadataStore`] owns one storage path. Every backup run gets its own
//! directory underneath it, holding the directory archives and a
//! `metadata.json` file with the serialized [`BackupRecord`]:
//!
//! ```text
//! <storage-path>/
//! ├── nightly-20240115-020000-000000/
//! │   ├── data.tar
//! │   ├── config.tar.gz
//! │   └── metadata.json
//! └── nightly-20240116-020000-000000/
//!     └── ...
//! ```
//!
//! Directories without a readable `metadata.json` are not backups (a run in
//! progress, or leftovers of something else) and are ignored when listing.

use crate::error::{Result, VaultError};
use crate::record::BackupRecord;
use crate::utils;
use chrono::{DateTime, Duration, Utc};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, trace, warn};

/// Name of the serialized record inside a run directory
pub const METADATA_FILE: &str = "metadata.json";

/// Timestamp format used in backup ids
const ID_TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S-%6f";

/// Build the id of a backup of `job` created at `timestamp`
pub fn backup_id(job: &str, timestamp: DateTime<Utc>) -> String {
    format!("{}-{}", job, timestamp.format(ID_TIMESTAMP_FORMAT))
}

/// Reads and writes backup records under one storage path
#[derive(Debug, Clone)]
pub struct MetadataStore {
    root: PathBuf,
}

impl MetadataStore {
    /// Create a store over `root`; nothing is touched until first use
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Storage path of this store
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory of the backup with the given id
    pub fn run_dir(&self, id: &str) -> PathBuf {
        self.root.join(id)
    }

    /// Create a fresh run directory for `job` and return its id and path
    ///
    /// The directory is created exclusively. If another run of the same job
    /// already claimed the id, the timestamp is advanced by one microsecond
    /// until a free id is found, so ids stay unique within the storage path.
    pub fn reserve(&self, job: &str, timestamp: DateTime<Utc>) -> Result<(String, DateTime<Utc>, PathBuf)> {
        fs::create_dir_all(&self.root)?;

        let mut timestamp = timestamp;
        loop {
            let id = backup_id(job, timestamp);
            let dir = self.run_dir(&id);
            match fs::create_dir(&dir) {
                Ok(()) => {
                    debug!("Reserved run directory {:?}", dir);
                    return Ok((id, timestamp, dir));
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    trace!("Backup id {} taken, advancing", id);
                    timestamp += Duration::microseconds(1);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Persist `record` into its run directory
    pub fn save(&self, record: &BackupRecord) -> Result<PathBuf> {
        let dir = self.run_dir(&record.id);
        fs::create_dir_all(&dir)?;
        let path = dir.join(METADATA_FILE);
        let json = serde_json::to_vec_pretty(record)?;
        utils::atomic_write(&path, &json)?;
        debug!("Saved backup record {}", record.id);
        Ok(path)
    }

    /// Load the record with the given id
    pub fn load(&self, id: &str) -> Result<BackupRecord> {
        let path = self.run_dir(id).join(METADATA_FILE);
        if !path.is_file() {
            return Err(VaultError::RecordNotFound(id.to_string()));
        }
        let bytes = fs::read(&path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Whether a record with the given id exists
    pub fn contains(&self, id: &str) -> bool {
        self.run_dir(id).join(METADATA_FILE).is_file()
    }

    /// All records of `job`, newest first
    ///
    /// Unreadable metadata files are skipped with a warning.
    pub fn list(&self, job: &str) -> Result<Vec<BackupRecord>> {
        let mut records: Vec<BackupRecord> = self
            .list_all()?
            .into_iter()
            .filter(|r| r.belongs_to(job))
            .collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp).then_with(|| b.id.cmp(&a.id)));
        Ok(records)
    }

    /// Every record under the storage path regardless of job
    pub fn list_all(&self) -> Result<Vec<BackupRecord>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path().join(METADATA_FILE);
            if !path.is_file() {
                continue;
            }
            match fs::read(&path).map_err(VaultError::from).and_then(|bytes| {
                serde_json::from_slice::<BackupRecord>(&bytes).map_err(VaultError::from)
            }) {
                Ok(record) => records.push(record),
                Err(e) => warn!("Skipping unreadable backup metadata {:?}: {}", path, e),
            }
        }
        Ok(records)
    }

    /// Delete a backup (archives and metadata)
    pub fn delete(&self, id: &str) -> Result<()> {
        let dir = self.run_dir(id);
        fs::remove_dir_all(&dir).map_err(|source| VaultError::RetentionDeletion {
            id: id.to_string(),
            source,
        })?;
        debug!("Deleted backup {}", id);
        Ok(())
    }

    /// Remove a run directory that never received a record
    pub fn discard(&self, dir: &Path) {
        if let Err(e) = fs::remove_dir_all(dir) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Failed to remove partial run directory {:?}: {}", dir, e);
            }
        }
    }
}
