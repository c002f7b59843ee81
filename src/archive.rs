//! Directory archiving
//!
//! The [`Archiver`] turns one [`DirectoryEntry`] into a tar bundle at
//! `<run-dir>/<logical-name>.tar[.gz]` and describes it with a
//! [`DirectoryRecord`].
//!
//! ## Stream layout
//!
//! ```text
//! file  <-  HashingWriter  <-  [GzEncoder]  <-  tar::Builder  <-  walked entries
//! ```
//!
//! Tar encoding happens first and gzip wraps it. The hashing writer sits
//! outside both, so the digest it accumulates is the hash of the bytes that
//! land on disk. After the archive is published the file is hashed again from
//! disk and the two digests must agree.
//!
//! ## Entry order and naming
//!
//! The source tree is walked sorted by file name, so the same tree always
//! yields the same member order. Member names are paths relative to the
//! source directory; the source directory itself is never a member.
//!
//! ## Failure policy
//!
//! - Source directory missing: [`VaultError::SourceUnavailable`], which the
//!   orchestrator treats as a per-directory skip.
//! - Any entry inside the tree unreadable: [`VaultError::SourceRead`]. The
//!   whole run aborts; a backup with holes is not produced.
//! - Archive target not writable: [`VaultError::ArchiveWrite`].
//!
//! The archive is written to a temporary file in the run directory and renamed
//! into place only once complete, so a failed or cancelled run never leaves a
//! partial archive under the final name.

use crate::error::{Result, VaultError};
use crate::record::{DirectoryRecord, FilePermissionRecord};
use crate::types::DirectoryEntry;
use crate::utils::{self, HashingWriter};
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tar::{EntryType, Header, HeaderMode};
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace};
use walkdir::WalkDir;

/// Result of archiving one directory
#[derive(Debug, Clone)]
pub struct ArchiveOutput {
    /// Description of the archive, ready to be embedded in a backup record
    pub record: DirectoryRecord,
    /// Final location of the archive file
    pub archive_path: PathBuf,
    /// Compressed (on-disk) size of the archive
    pub archive_size: u64,
}

/// Writes directory trees into checksummed tar bundles
#[derive(Debug, Clone, Default)]
pub struct Archiver {
    follow_symlinks: bool,
}

impl Archiver {
    /// Create an archiver that stores symbolic links as links
    pub fn new() -> Self {
        Self::default()
    }

    /// Follow symbolic links and archive their targets instead
    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    /// Archive `entry` into `run_dir`
    ///
    /// Checks `cancel` before every entry; a cancelled walk returns
    /// [`VaultError::Cancelled`] and leaves nothing at the final path.
    #[instrument(skip(self, cancel), fields(name = %entry.name))]
    pub fn archive(
        &self,
        entry: &DirectoryEntry,
        run_dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<ArchiveOutput> {
        if !entry.path.is_dir() {
            return Err(VaultError::SourceUnavailable(entry.path.clone()));
        }

        let excludes = build_excludes(&entry.exclude)?;
        let final_path = run_dir.join(entry.archive_file_name());
        let write_err = |source: io::Error| VaultError::ArchiveWrite {
            path: final_path.clone(),
            source,
        };

        debug!("Archiving {:?} -> {:?}", entry.path, final_path);

        let temp = NamedTempFile::new_in(run_dir).map_err(write_err)?;
        let file = temp.as_file().try_clone().map_err(write_err)?;
        let hashing = HashingWriter::new(BufWriter::new(file));

        let (hashing, stats) = if entry.compress {
            let encoder = GzEncoder::new(hashing, Compression::default());
            let (encoder, stats) = self.write_tar(encoder, entry, excludes.as_ref(), cancel, &final_path)?;
            (encoder.finish().map_err(write_err)?, stats)
        } else {
            self.write_tar(hashing, entry, excludes.as_ref(), cancel, &final_path)?
        };

        let archive_size = hashing.bytes_written();
        let (mut buffered, streamed_checksum) = hashing.finish();
        buffered.flush().map_err(write_err)?;
        let file = buffered
            .into_inner()
            .map_err(|e| write_err(e.into_error()))?;
        file.sync_all().map_err(write_err)?;
        drop(file);

        if cancel.is_cancelled() {
            return Err(VaultError::Cancelled);
        }

        temp.persist(&final_path).map_err(|e| write_err(e.error))?;

        let on_disk_checksum = utils::hash_file_content(&final_path)?;
        if on_disk_checksum != streamed_checksum {
            return Err(VaultError::HashMismatch {
                expected: streamed_checksum,
                actual: on_disk_checksum,
            });
        }

        info!(
            "Archived {} ({} files, {} source, {} archive)",
            entry.name,
            stats.file_count,
            utils::format_bytes(stats.size),
            utils::format_bytes(archive_size)
        );

        Ok(ArchiveOutput {
            record: DirectoryRecord {
                path: entry.path.clone(),
                name: entry.name.clone(),
                size: stats.size,
                file_count: stats.file_count,
                permissions: stats.permissions,
                checksum: on_disk_checksum,
                compressed: entry.compress,
            },
            archive_path: final_path,
            archive_size,
        })
    }

    /// Walk the source tree and append every entry to a tar stream over `writer`
    fn write_tar<W: Write>(
        &self,
        writer: W,
        entry: &DirectoryEntry,
        excludes: Option<&GlobSet>,
        cancel: &CancellationToken,
        archive_path: &Path,
    ) -> Result<(W, WalkStats)> {
        let write_err = |source: io::Error| VaultError::ArchiveWrite {
            path: archive_path.to_path_buf(),
            source,
        };

        let mut builder = tar::Builder::new(writer);
        builder.follow_symlinks(self.follow_symlinks);
        let mut stats = WalkStats::default();

        let walker = WalkDir::new(&entry.path)
            .follow_links(self.follow_symlinks)
            .min_depth(1)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| !is_excluded(excludes, &entry.path, e.path()));

        for walked in walker {
            if cancel.is_cancelled() {
                debug!("Archiving of {} cancelled", entry.name);
                return Err(VaultError::Cancelled);
            }

            let walked = walked.map_err(|e| {
                let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| entry.path.clone());
                VaultError::SourceRead {
                    path,
                    source: e.into_io_error().unwrap_or_else(|| io::Error::other("directory walk failed")),
                }
            })?;

            let path = walked.path();
            let relative = utils::make_relative(path, &entry.path)?;
            let key = utils::path_key(&relative);
            let read_err = |source: io::Error| VaultError::SourceRead {
                path: path.to_path_buf(),
                source,
            };

            let metadata = if self.follow_symlinks {
                path.metadata().map_err(read_err)?
            } else {
                path.symlink_metadata().map_err(read_err)?
            };
            let captured = utils::capture_metadata(&metadata).map_err(read_err)?;

            let mut header = Header::new_gnu();
            header.set_metadata_in_mode(&metadata, HeaderMode::Complete);

            let file_type = metadata.file_type();
            if file_type.is_dir() {
                header.set_entry_type(EntryType::Directory);
                header.set_size(0);
                builder
                    .append_data(&mut header, &relative, io::empty())
                    .map_err(write_err)?;
            } else if file_type.is_symlink() {
                let target = std::fs::read_link(path).map_err(read_err)?;
                header.set_entry_type(EntryType::Symlink);
                header.set_size(0);
                builder
                    .append_link(&mut header, &relative, &target)
                    .map_err(write_err)?;
                stats.file_count += 1;
            } else if file_type.is_file() {
                let file = File::open(path).map_err(read_err)?;
                header.set_size(metadata.len());
                builder
                    .append_data(&mut header, &relative, file)
                    .map_err(|source| {
                        // The tar writer reports read and write failures alike
                        if source.kind() == io::ErrorKind::PermissionDenied
                            || source.kind() == io::ErrorKind::UnexpectedEof
                        {
                            read_err(source)
                        } else {
                            write_err(source)
                        }
                    })?;
                stats.file_count += 1;
                stats.size += metadata.len();
            } else {
                trace!("Skipping special file {:?}", path);
                continue;
            }

            trace!("Archived entry {}", key);
            stats.permissions.insert(
                key,
                FilePermissionRecord {
                    mode: captured.mode,
                    uid: captured.uid,
                    gid: captured.gid,
                    size: captured.size,
                    mod_time: DateTime::<Utc>::from(captured.modified),
                },
            );
        }

        let writer = builder.into_inner().map_err(write_err)?;
        Ok((writer, stats))
    }
}

#[derive(Debug, Default)]
struct WalkStats {
    size: u64,
    file_count: usize,
    permissions: BTreeMap<String, FilePermissionRecord>,
}

fn build_excludes(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(Some(builder.build()?))
}

fn is_excluded(excludes: Option<&GlobSet>, root: &Path, path: &Path) -> bool {
    match (excludes, path.strip_prefix(root)) {
        (Some(set), Ok(relative)) => set.is_match(relative),
        _ => false,
    }
}
