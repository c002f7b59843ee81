//! Archive extraction
//!
//! The [`Restorer`] is the inverse of [`crate::archive::Archiver`]: it reads
//! one directory archive and recreates the tree under a target directory,
//! reapplying the permissions, modification times and (when privileged)
//! ownership captured in the [`DirectoryRecord`].
//!
//! ## Member names
//!
//! Archives written by this crate use paths relative to the source directory.
//! Archives that carry an extra leading `<logical-name>/` folder are accepted
//! too; the prefix is stripped so files always land directly under the target.
//! Members with absolute paths or `..` components are skipped with a warning.
//!
//! ## Failure policy
//!
//! A missing archive, a corrupt tar or gzip stream, or a checksum that does
//! not match the record fails the restore of this directory. Ownership that
//! cannot be applied, a mode or mtime that cannot be set, or an unsupported
//! entry type only add a warning to the [`DirectoryRestore`].

use crate::error::{Result, VaultError};
use crate::record::{DirectoryRecord, FilePermissionRecord};
use crate::utils;
use filetime::FileTime;
use flate2::read::GzDecoder;
use std::fs::{self, File};
use std::io::{self, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};
use tar::EntryType;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace, warn};

/// Outcome of restoring one directory archive
#[derive(Debug, Clone, Default)]
pub struct DirectoryRestore {
    /// Logical name of the directory
    pub name: String,
    /// Directory the archive was extracted into
    pub target: PathBuf,
    /// Number of non-directory entries written
    pub files_restored: usize,
    /// Bytes of file content written
    pub bytes_written: u64,
    /// Non-fatal problems encountered
    pub warnings: Vec<String>,
}

/// Outcome of restoring a whole backup record
#[derive(Debug, Clone, Default)]
pub struct RestoreReport {
    /// Backup record id
    pub id: String,
    /// Successfully restored directories
    pub restored: Vec<DirectoryRestore>,
    /// Directories that failed, with the reason
    pub failed: Vec<(String, String)>,
}

impl RestoreReport {
    /// Whether every directory was restored
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    /// Total files written across all directories
    pub fn files_restored(&self) -> usize {
        self.restored.iter().map(|d| d.files_restored).sum()
    }

    /// All warnings, prefixed with the directory they belong to
    pub fn warnings(&self) -> Vec<String> {
        self.restored
            .iter()
            .flat_map(|d| d.warnings.iter().map(move |w| format!("{}: {}", d.name, w)))
            .collect()
    }
}

/// Extracts directory archives
#[derive(Debug, Clone)]
pub struct Restorer {
    verify_checksum: bool,
}

impl Default for Restorer {
    fn default() -> Self {
        Self {
            verify_checksum: true,
        }
    }
}

impl Restorer {
    /// Create a restorer that checks the archive checksum before extracting
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable the pre-extraction checksum check
    pub fn verify_checksum(mut self, verify: bool) -> Self {
        self.verify_checksum = verify;
        self
    }

    /// Extract `archive` into `target`
    ///
    /// # Arguments
    ///
    /// * `record` - Directory record describing the archive
    /// * `archive` - Path of the `.tar` / `.tar.gz` file
    /// * `target` - Directory to extract into; created if absent
    /// * `cancel` - Checked between entries
    ///
    /// # Errors
    ///
    /// [`VaultError::RestoreRead`] for a missing or corrupt archive,
    /// [`VaultError::HashMismatch`] when checksum verification is on and the
    /// archive does not match the record, [`VaultError::Cancelled`] and
    /// [`VaultError::Io`] for failures writing the target.
    #[instrument(skip(self, record, cancel), fields(name = %record.name))]
    pub fn restore(
        &self,
        record: &DirectoryRecord,
        archive: &Path,
        target: &Path,
        cancel: &CancellationToken,
    ) -> Result<DirectoryRestore> {
        if !archive.is_file() {
            return Err(VaultError::RestoreRead {
                path: archive.to_path_buf(),
                reason: "archive file is missing".to_string(),
            });
        }

        if self.verify_checksum {
            let actual = utils::hash_file_content(archive)?;
            if actual != record.checksum {
                return Err(VaultError::HashMismatch {
                    expected: record.checksum.clone(),
                    actual,
                });
            }
        }

        fs::create_dir_all(target)?;

        let file = File::open(archive).map_err(|e| read_error(archive, e))?;
        let reader: Box<dyn Read> = if record.compressed {
            Box::new(GzDecoder::new(BufReader::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };

        let mut report = DirectoryRestore {
            name: record.name.clone(),
            target: target.to_path_buf(),
            ..Default::default()
        };
        let mut directories: Vec<(PathBuf, Option<FilePermissionRecord>)> = Vec::new();
        let privileged = is_privileged();

        let mut tar = tar::Archive::new(reader);
        let entries = tar.entries().map_err(|e| read_error(archive, e))?;

        for entry in entries {
            if cancel.is_cancelled() {
                debug!("Restore of {} cancelled", record.name);
                return Err(VaultError::Cancelled);
            }

            let mut entry = entry.map_err(|e| read_error(archive, e))?;
            let raw_path = entry.path().map_err(|e| read_error(archive, e))?.into_owned();

            let Some(relative) = member_path(&raw_path, record) else {
                let warning = format!("skipped unsafe member path {:?}", raw_path);
                warn!("{}", warning);
                report.warnings.push(warning);
                continue;
            };
            if relative.as_os_str().is_empty() {
                continue;
            }

            let key = utils::path_key(&relative);
            let dest = target.join(&relative);
            let permission = record.permissions.get(&key).cloned();
            let entry_type = entry.header().entry_type();

            match entry_type {
                EntryType::Directory => {
                    fs::create_dir_all(&dest)?;
                    directories.push((dest, permission));
                }
                EntryType::Regular | EntryType::Continuous => {
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    remove_existing(&dest)?;

                    let mut out = File::create(&dest)?;
                    let written = copy_entry(&mut entry, &mut out, archive)?;
                    out.flush()?;
                    drop(out);

                    report.bytes_written += written;
                    report.files_restored += 1;

                    let mode = entry.header().mode().ok();
                    apply_file_metadata(&dest, permission.as_ref(), mode, privileged, &key, &mut report.warnings);
                }
                EntryType::Symlink => {
                    let link_target = entry
                        .link_name()
                        .map_err(|e| read_error(archive, e))?
                        .map(|t| t.into_owned());
                    let Some(link_target) = link_target else {
                        report.warnings.push(format!("{}: symlink without target", key));
                        continue;
                    };
                    if let Some(parent) = dest.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    remove_existing(&dest)?;
                    match utils::create_symlink(&link_target, &dest) {
                        Ok(()) => {
                            report.files_restored += 1;
                            if let Some(perm) = &permission {
                                apply_link_ownership(&dest, perm, privileged, &key, &mut report.warnings);
                            }
                        }
                        Err(e) => {
                            let warning = format!("{}: could not create symlink: {}", key, e);
                            warn!("{}", warning);
                            report.warnings.push(warning);
                        }
                    }
                }
                other => {
                    let warning = format!("{}: unsupported entry type {:?} skipped", key, other);
                    debug!("{}", warning);
                    report.warnings.push(warning);
                }
            }

            trace!("Restored {}", key);
        }

        // Children first, so read-only directories do not block their contents
        directories.sort_by_key(|(path, _)| std::cmp::Reverse(path.components().count()));
        for (path, permission) in &directories {
            let key = utils::path_key(path.strip_prefix(target).unwrap_or(path));
            apply_file_metadata(path, permission.as_ref(), None, privileged, &key, &mut report.warnings);
        }

        info!(
            "Restored {} into {:?} ({} files, {})",
            record.name,
            target,
            report.files_restored,
            utils::format_bytes(report.bytes_written)
        );

        Ok(report)
    }
}

fn read_error(archive: &Path, err: io::Error) -> VaultError {
    VaultError::RestoreRead {
        path: archive.to_path_buf(),
        reason: err.to_string(),
    }
}

/// Map an archive member path to a path relative to the target
///
/// Returns `None` for members that would escape the target and an empty
/// path for the archive root. The raw bytes of the name are kept; only the
/// permission lookup goes through [`utils::path_key`].
fn member_path(raw: &Path, record: &DirectoryRecord) -> Option<PathBuf> {
    if !utils::is_contained(raw) {
        return None;
    }
    let relative: PathBuf = raw
        .components()
        .filter(|c| matches!(c, Component::Normal(_)))
        .collect();
    if relative.as_os_str().is_empty() || record.permissions.contains_key(&utils::path_key(&relative)) {
        return Some(relative);
    }
    match relative.strip_prefix(&record.name) {
        Ok(rest) => Some(rest.to_path_buf()),
        Err(_) => Some(relative),
    }
}

/// Copy entry content, telling archive read failures apart from target write failures
fn copy_entry<R: Read, W: Write>(reader: &mut R, writer: &mut W, archive: &Path) -> Result<u64> {
    let mut buffer = vec![0u8; 64 * 1024];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(read_error(archive, e)),
        };
        writer.write_all(&buffer[..n])?;
        total += n as u64;
    }
    Ok(total)
}

fn remove_existing(dest: &Path) -> Result<()> {
    match fs::symlink_metadata(dest) {
        Ok(meta) if !meta.is_dir() => {
            fs::remove_file(dest)?;
            Ok(())
        }
        _ => Ok(()),
    }
}

fn apply_file_metadata(
    path: &Path,
    permission: Option<&FilePermissionRecord>,
    header_mode: Option<u32>,
    privileged: bool,
    key: &str,
    warnings: &mut Vec<String>,
) {
    // Ownership first: chown clears setuid/setgid bits
    if let Some(perm) = permission {
        apply_ownership(path, perm, privileged, key, warnings);
    }

    let mode = permission.map(|p| p.mode).or(header_mode.map(|m| m & 0o7777));
    if let Some(mode) = mode {
        if let Err(e) = utils::set_permissions(path, mode) {
            warnings.push(format!("{}: could not set mode {:04o}: {}", key, mode, e));
        }
    }

    if let Some(perm) = permission {
        let mtime = FileTime::from_unix_time(perm.mod_time.timestamp(), perm.mod_time.timestamp_subsec_nanos());
        if let Err(e) = filetime::set_file_mtime(path, mtime) {
            warnings.push(format!("{}: could not set modification time: {}", key, e));
        }
    }
}

#[cfg(unix)]
fn is_privileged() -> bool {
    nix::unistd::Uid::effective().is_root()
}

#[cfg(not(unix))]
fn is_privileged() -> bool {
    false
}

#[cfg(unix)]
fn apply_ownership(
    path: &Path,
    perm: &FilePermissionRecord,
    privileged: bool,
    key: &str,
    warnings: &mut Vec<String>,
) {
    use nix::unistd::{chown, Gid, Uid};

    if privileged {
        if let Err(e) = chown(path, Some(Uid::from_raw(perm.uid)), Some(Gid::from_raw(perm.gid))) {
            warnings.push(format!("{}: could not restore ownership: {}", key, e));
        }
    } else if perm.uid != Uid::effective().as_raw() || perm.gid != Gid::effective().as_raw() {
        let warning = format!(
            "{}: ownership {}:{} not restored (insufficient privilege)",
            key, perm.uid, perm.gid
        );
        debug!("{}", warning);
        warnings.push(warning);
    }
}

#[cfg(not(unix))]
fn apply_ownership(
    _path: &Path,
    _perm: &FilePermissionRecord,
    _privileged: bool,
    _key: &str,
    _warnings: &mut Vec<String>,
) {
}

#[cfg(unix)]
fn apply_link_ownership(
    path: &Path,
    perm: &FilePermissionRecord,
    privileged: bool,
    key: &str,
    warnings: &mut Vec<String>,
) {
    if privileged {
        if let Err(e) = std::os::unix::fs::lchown(path, Some(perm.uid), Some(perm.gid)) {
            warnings.push(format!("{}: could not restore link ownership: {}", key, e));
        }
    }
}

#[cfg(not(unix))]
fn apply_link_ownership(
    _path: &Path,
    _perm: &FilePermissionRecord,
    _privileged: bool,
    _key: &str,
    _warnings: &mut Vec<String>,
) {
}
