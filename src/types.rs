//! Core configuration types used throughout dirvault
//!
//! These types describe *what* to back up: a [`BackupJob`] names one or more
//! [`DirectoryEntry`] sources, where the bundles go ([`StorageTarget`]), how
//! long they are kept ([`RetentionPolicy`]) and how often the scheduler runs
//! the job ([`Schedule`]). The engine only ever reads them; they change when
//! the configuration changes.
//!
//! ## Examples
//!
//! ```rust
//! use dirvault::types::{BackupJob, DirectoryEntry, RetentionPolicy, StorageTarget};
//! use std::path::PathBuf;
//!
//! let job = BackupJob {
//!     name: "nightly".to_string(),
//!     directories: vec![DirectoryEntry::new("/srv/data", "data")],
//!     retention: RetentionPolicy { keep_days: 30, keep_count: 10, keep_monthly: 1 },
//!     storage: StorageTarget::local("/backups/nightly"),
//!     ..Default::default()
//! };
//! assert!(job.validate().is_ok());
//! ```

use crate::error::{Result, VaultError};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

fn default_true() -> bool {
    true
}

/// A named, independently schedulable backup unit
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupJob {
    /// Unique job name; also the prefix of every backup id of the job
    pub name: String,
    /// Human-readable label
    #[serde(default)]
    pub display_name: Option<String>,
    /// Disabled jobs are skipped by the scheduler and by run-all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Directories archived on every run, in order
    pub directories: Vec<DirectoryEntry>,
    /// Pruning rules applied after each successful run
    #[serde(default)]
    pub retention: RetentionPolicy,
    /// Where the backups of this job live
    pub storage: StorageTarget,
    /// When the scheduler should run the job
    #[serde(default)]
    pub schedule: Schedule,
    /// Do not call the quiesce/resume hooks around this job
    #[serde(default)]
    pub skip_quiesce: bool,
    /// Write to the local path even if the storage kind is remote
    #[serde(default)]
    pub skip_remote: bool,
}

impl Default for BackupJob {
    fn default() -> Self {
        Self {
            name: String::new(),
            display_name: None,
            enabled: true,
            directories: Vec::new(),
            retention: RetentionPolicy::default(),
            storage: StorageTarget::default(),
            schedule: Schedule::default(),
            skip_quiesce: false,
            skip_remote: false,
        }
    }
}

impl BackupJob {
    /// Label for display: the display name when set, the job name otherwise
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.name)
    }

    /// Whether the scheduler should consider this job at all
    pub fn is_schedulable(&self) -> bool {
        self.enabled && self.schedule.enabled
    }

    /// Check the job for configuration errors
    ///
    /// Names must be usable as file-name prefixes, logical directory names
    /// must be unique (they become archive file names), and a remote target
    /// needs a bucket reference unless the remote step is skipped.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(VaultError::config("job name must not be empty"));
        }
        if !is_plain_name(&self.name) {
            return Err(VaultError::config(format!(
                "job name '{}' must not contain path separators",
                self.name
            )));
        }
        if self.directories.is_empty() {
            return Err(VaultError::config(format!(
                "job '{}' has no directories configured",
                self.name
            )));
        }

        let mut names = HashSet::new();
        for dir in &self.directories {
            if dir.name.trim().is_empty() || !is_plain_name(&dir.name) {
                return Err(VaultError::config(format!(
                    "job '{}': invalid logical directory name '{}'",
                    self.name, dir.name
                )));
            }
            if !names.insert(dir.name.as_str()) {
                return Err(VaultError::config(format!(
                    "job '{}': duplicate logical directory name '{}'",
                    self.name, dir.name
                )));
            }
        }

        if self.storage.kind == StorageKind::Remote && !self.skip_remote {
            match &self.storage.remote {
                Some(remote) if !remote.bucket.trim().is_empty() => {
                    if remote.mount_point.as_os_str().is_empty() {
                        return Err(VaultError::config(format!(
                            "job '{}' uses remote storage but has no mount point",
                            self.name
                        )));
                    }
                }
                _ => {
                    return Err(VaultError::config(format!(
                        "job '{}' uses remote storage but has no bucket reference",
                        self.name
                    )))
                }
            }
        } else if self.storage.local_path.as_os_str().is_empty() {
            return Err(VaultError::config(format!(
                "job '{}' has no local storage path",
                self.name
            )));
        }

        Ok(())
    }
}

fn is_plain_name(name: &str) -> bool {
    !name.contains('/') && !name.contains('\\') && name != "." && name != ".."
}

/// One source directory of a job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirectoryEntry {
    /// Source directory on the local filesystem
    pub path: PathBuf,
    /// Logical name: archive member stem and restore subdirectory
    pub name: String,
    /// Gzip the tar stream
    #[serde(default)]
    pub compress: bool,
    /// Glob patterns (relative to `path`) left out of the archive
    #[serde(default)]
    pub exclude: Vec<String>,
}

impl DirectoryEntry {
    /// Create an uncompressed entry without excludes
    pub fn new(path: impl Into<PathBuf>, name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            name: name.into(),
            compress: false,
            exclude: Vec::new(),
        }
    }

    /// Builder-style toggle for compression
    pub fn compressed(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Archive file name for this entry (`<name>.tar` or `<name>.tar.gz`)
    pub fn archive_file_name(&self) -> String {
        archive_file_name(&self.name, self.compress)
    }
}

/// Archive file name for a logical name
pub fn archive_file_name(name: &str, compressed: bool) -> String {
    if compressed {
        format!("{}.tar.gz", name)
    } else {
        format!("{}.tar", name)
    }
}

/// Retention rules; a zero value disables the corresponding rule
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Delete backups older than this many days
    #[serde(default)]
    pub keep_days: u32,
    /// Keep only the most recent N backups
    #[serde(default)]
    pub keep_count: usize,
    /// Keep one backup per calendar month (any value above zero)
    #[serde(default)]
    pub keep_monthly: u32,
}

impl RetentionPolicy {
    /// Whether any rule is active
    pub fn is_active(&self) -> bool {
        self.keep_days > 0 || self.keep_count > 0 || self.keep_monthly > 0
    }
}

/// Kind of storage destination
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    /// A local directory
    #[default]
    Local,
    /// Object storage mounted at a local path by an external tool
    Remote,
}

/// Remote object storage mounted at a local path
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteMount {
    /// Bucket reference (used for validation and logging only)
    pub bucket: String,
    /// Local path where the bucket is mounted
    pub mount_point: PathBuf,
}

/// Storage destination selector
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StorageTarget {
    /// Which destination to use
    #[serde(default)]
    pub kind: StorageKind,
    /// Local directory (also the fallback when the remote step is skipped)
    #[serde(default)]
    pub local_path: PathBuf,
    /// Remote mount description
    #[serde(default)]
    pub remote: Option<RemoteMount>,
}

impl StorageTarget {
    /// Local storage at `path`
    pub fn local(path: impl Into<PathBuf>) -> Self {
        Self {
            kind: StorageKind::Local,
            local_path: path.into(),
            remote: None,
        }
    }

    /// Remote storage mounted at `mount_point`
    pub fn remote(bucket: impl Into<String>, mount_point: impl Into<PathBuf>) -> Self {
        Self {
            kind: StorageKind::Remote,
            local_path: PathBuf::new(),
            remote: Some(RemoteMount {
                bucket: bucket.into(),
                mount_point: mount_point.into(),
            }),
        }
    }
}

/// Schedule descriptor
///
/// `interval` is either a duration (`"90m"`, `"2h 30m"`) or a named alias
/// such as `"daily"`; see [`crate::scheduler::parse_interval`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Schedule {
    /// Whether the scheduler runs this job
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Interval between runs
    #[serde(default = "default_interval")]
    pub interval: String,
}

fn default_interval() -> String {
    "daily".to_string()
}

impl Default for Schedule {
    fn default() -> Self {
        Self {
            enabled: true,
            interval: default_interval(),
        }
    }
}

impl Schedule {
    /// Enabled schedule with the given interval
    pub fn every(interval: impl Into<String>) -> Self {
        Self {
            enabled: true,
            interval: interval.into(),
        }
    }
}
