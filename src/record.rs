//! Backup record definitions
//!
//! A [`BackupRecord`] is the persisted description of one completed backup
//! run: which directories were archived, how big they were, and the checksums
//! needed to verify them later. Records are created once and are read-only
//! afterwards; retention pruning deletes them wholesale.
//!
//! ## Checksums
//!
//! Each [`DirectoryRecord::checksum`] is the SHA-256 of its archive file as
//! stored on disk. The record-level [`BackupRecord::checksum`] is derived
//! purely from the ordered `(name, checksum)` pairs of its directories, so it
//! can be recomputed from the metadata file alone:
//!
//! ```rust
//! use dirvault::record::{BackupRecord, DirectoryRecord};
//! use chrono::Utc;
//!
//! let dir = DirectoryRecord {
//!     path: "/srv/data".into(),
//!     name: "data".to_string(),
//!     size: 12,
//!     file_count: 1,
//!     permissions: Default::default(),
//!     checksum: "ab".repeat(32),
//!     compressed: false,
//! };
//! let record = BackupRecord::new("nightly", "nightly-1".to_string(), Utc::now(), vec![dir]);
//! assert!(record.verify_checksum());
//! ```
//!
//! ## Permission modes
//!
//! [`FilePermissionRecord::mode`] is written as a four-digit octal string
//! (`"0644"`). On read both octal (`"644"`, `"0o755"`) and symbolic
//! (`"-rwxr-xr-x"`, `"drwxr-sr-t"`) forms are accepted.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Persisted description of one completed backup run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BackupRecord {
    /// `<job-name>-<timestamp>`, unique within the job's storage path
    pub id: String,
    /// Job that produced this record
    #[serde(default)]
    pub job: String,
    /// Creation timestamp (RFC 3339 on disk)
    pub timestamp: DateTime<Utc>,
    /// Archived directories in job order
    pub directories: Vec<DirectoryRecord>,
    /// Sum of the source bytes of all directories
    pub total_size: u64,
    /// Combined checksum over the directory checksums
    pub checksum: String,
    /// Whether any directory archive is gzip-compressed
    pub compressed: bool,
}

impl BackupRecord {
    /// Assemble a record, deriving size, compression flag and combined checksum
    pub fn new(
        job: impl Into<String>,
        id: String,
        timestamp: DateTime<Utc>,
        directories: Vec<DirectoryRecord>,
    ) -> Self {
        let total_size = directories.iter().map(|d| d.size).sum();
        let compressed = directories.iter().any(|d| d.compressed);
        let checksum = Self::combined_checksum(&directories);

        Self {
            id,
            job: job.into(),
            timestamp,
            directories,
            total_size,
            checksum,
            compressed,
        }
    }

    /// Combined checksum of a directory list
    ///
    /// SHA-256 over `name:checksum\n` for each directory in order. Depends on
    /// nothing but the names and checksums.
    pub fn combined_checksum(directories: &[DirectoryRecord]) -> String {
        let mut hasher = Sha256::new();
        for dir in directories {
            hasher.update(dir.name.as_bytes());
            hasher.update(b":");
            hasher.update(dir.checksum.as_bytes());
            hasher.update(b"\n");
        }
        hex::encode(hasher.finalize())
    }

    /// Whether the stored combined checksum matches the directory list
    pub fn verify_checksum(&self) -> bool {
        self.checksum == Self::combined_checksum(&self.directories)
    }

    /// Total number of files across all directories
    pub fn file_count(&self) -> usize {
        self.directories.iter().map(|d| d.file_count).sum()
    }

    /// Look up a directory by logical name
    pub fn directory(&self, name: &str) -> Option<&DirectoryRecord> {
        self.directories.iter().find(|d| d.name == name)
    }

    /// Whether this record belongs to `job`
    ///
    /// Records written without a job field are attributed by id prefix.
    pub fn belongs_to(&self, job: &str) -> bool {
        if self.job.is_empty() {
            self.id
                .strip_prefix(job)
                .is_some_and(|rest| rest.starts_with('-'))
        } else {
            self.job == job
        }
    }
}

/// One archived directory inside a backup record
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DirectoryRecord {
    /// Source directory that was archived
    pub path: PathBuf,
    /// Logical name (archive file stem)
    pub name: String,
    /// Sum of the sizes of the archived regular files
    pub size: u64,
    /// Number of non-directory entries archived
    pub file_count: usize,
    /// Relative path key (see [`crate::utils::path_key`]) to captured metadata, directories included
    #[serde(default)]
    pub permissions: BTreeMap<String, FilePermissionRecord>,
    /// SHA-256 of the archive file bytes
    pub checksum: String,
    /// Whether the archive is gzip-compressed
    pub compressed: bool,
}

impl DirectoryRecord {
    /// Archive file name inside the backup directory
    pub fn archive_file_name(&self) -> String {
        crate::types::archive_file_name(&self.name, self.compressed)
    }
}

/// Metadata captured for every archived entry
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FilePermissionRecord {
    /// Permission bits (including setuid/setgid/sticky)
    #[serde(with = "mode_format")]
    pub mode: u32,
    /// Owning user id
    pub uid: u32,
    /// Owning group id
    pub gid: u32,
    /// Size in bytes (0 for directories)
    pub size: u64,
    /// Modification time
    pub mod_time: DateTime<Utc>,
}

/// Parse a permission mode in octal or symbolic form
///
/// Octal: `"644"`, `"0644"`, `"0o4755"`. Symbolic: nine permission characters,
/// optionally preceded by a file-type character (`"-rw-r--r--"`,
/// `"drwxr-xr-x"`), with `s`/`S`/`t`/`T` for the special bits.
pub fn parse_mode(text: &str) -> Option<u32> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }

    let octal = text
        .strip_prefix("0o")
        .or_else(|| text.strip_prefix("0O"))
        .unwrap_or(text);
    if octal.chars().all(|c| ('0'..='7').contains(&c)) {
        return u32::from_str_radix(octal, 8)
            .ok()
            .filter(|mode| *mode <= 0o7777);
    }

    parse_symbolic(text)
}

fn parse_symbolic(text: &str) -> Option<u32> {
    let chars: Vec<char> = text.chars().collect();
    let perms = match chars.len() {
        9 => &chars[..],
        10 if "-dlcbps".contains(chars[0]) => &chars[1..],
        _ => return None,
    };

    let mut mode = 0u32;
    // (read bit, write bit, exec bit, special bit, special char lower-case)
    let triads = [
        (0o400, 0o200, 0o100, 0o4000, 's'),
        (0o040, 0o020, 0o010, 0o2000, 's'),
        (0o004, 0o002, 0o001, 0o1000, 't'),
    ];

    for (idx, (r, w, x, special, special_char)) in triads.iter().enumerate() {
        let triad = &perms[idx * 3..idx * 3 + 3];
        match triad[0] {
            'r' => mode |= r,
            '-' => {}
            _ => return None,
        }
        match triad[1] {
            'w' => mode |= w,
            '-' => {}
            _ => return None,
        }
        match triad[2] {
            'x' => mode |= x,
            '-' => {}
            c if c == *special_char => mode |= x | special,
            c if c == special_char.to_ascii_uppercase() => mode |= special,
            _ => return None,
        }
    }

    Some(mode)
}

/// Render a mode as a four-digit octal string
pub fn format_mode(mode: u32) -> String {
    format!("{:04o}", mode & 0o7777)
}

mod mode_format {
    use super::{format_mode, parse_mode};
    use serde::de::{self, Visitor};
    use serde::{Deserializer, Serializer};
    use std::fmt;

    pub fn serialize<S: Serializer>(mode: &u32, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format_mode(*mode))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u32, D::Error> {
        deserializer.deserialize_any(ModeVisitor)
    }

    struct ModeVisitor;

    impl<'de> Visitor<'de> for ModeVisitor {
        type Value = u32;

        fn expecting(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str("an octal or symbolic permission mode")
        }

        fn visit_str<E: de::Error>(self, value: &str) -> Result<u32, E> {
            parse_mode(value)
                .ok_or_else(|| E::custom(format!("invalid permission mode '{}'", value)))
        }

        // Raw integers are taken as the numeric mode value
        fn visit_u64<E: de::Error>(self, value: u64) -> Result<u32, E> {
            u32::try_from(value)
                .ok()
                .filter(|mode| *mode <= 0o7777)
                .ok_or_else(|| E::custom(format!("permission mode {} out of range", value)))
        }
    }
}
