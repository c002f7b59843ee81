//! Utility functions for dirvault
//!
//! Hashing helpers, file metadata extraction, permission handling and a few
//! path/formatting helpers shared by the archiver, restorer and metadata store.
//!
//! ## Hashing
//!
//! All checksums in the crate are lowercase hex SHA-256. [`hash_file_content`]
//! hashes a file from disk; [`HashingWriter`] hashes bytes as
//! they are written through it, which lets the archiver checksum an archive
//! while producing it.
//!
//! ```rust,ignore
//! use crate::utils::{hash_data, HashingWriter};
//! use std::io::Write;
//!
//! let mut writer = HashingWriter::new(Vec::new());
//! writer.write_all(b"hello")?;
//! let (bytes, digest) = writer.finish();
//! assert_eq!(digest, hash_data(&bytes));
//! ```

use crate::error::{Result, VaultError};
use sha2::{Digest, Sha256};
use std::ffi::OsStr;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};
use std::time::SystemTime;
use tracing::trace;

/// SHA-256 of a file's bytes, as lowercase hex
///
/// Streams the file through a [`HashingWriter`] over `io::sink`, so memory
/// use stays flat for large archives.
pub fn hash_file_content(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hashing = HashingWriter::new(io::sink());
    io::copy(&mut file, &mut hashing)?;
    let (_, digest) = hashing.finish();
    Ok(digest)
}

/// Hash arbitrary data using SHA-256
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Writer adapter that feeds every byte written through it into a SHA-256 hasher
///
/// Placed as the outermost layer around an archive file, the digest it
/// produces equals the hash of the file as it lands on disk.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    bytes_written: u64,
}

impl<W: Write> HashingWriter<W> {
    /// Wrap a writer
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes_written: 0,
        }
    }

    /// Number of bytes that went through the writer
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Return the inner writer and the hex digest of everything written
    pub fn finish(self) -> (W, String) {
        (self.inner, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.bytes_written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// File metadata container
///
/// Taken from whichever `fs::Metadata` the caller chose, so a walk that
/// does not follow links records the link itself.
#[derive(Debug, Clone)]
pub struct FileMetadata {
    /// File size in bytes (0 for anything but regular files)
    pub size: u64,
    /// Permission bits including setuid/setgid/sticky (e.g. 0o644, 0o4755)
    pub mode: u32,
    /// Owning user id (0 where the platform has no notion of it)
    pub uid: u32,
    /// Owning group id (0 where the platform has no notion of it)
    pub gid: u32,
    /// Last modification timestamp
    pub modified: SystemTime,
}

/// Extract the recorded attributes from `metadata`
pub fn capture_metadata(metadata: &fs::Metadata) -> io::Result<FileMetadata> {
    let (uid, gid) = ownership(metadata);

    Ok(FileMetadata {
        size: if metadata.is_file() { metadata.len() } else { 0 },
        mode: get_permissions(metadata),
        uid,
        gid,
        modified: metadata.modified()?,
    })
}

#[cfg(unix)]
fn ownership(metadata: &fs::Metadata) -> (u32, u32) {
    use std::os::unix::fs::MetadataExt;
    (metadata.uid(), metadata.gid())
}

#[cfg(not(unix))]
fn ownership(_metadata: &fs::Metadata) -> (u32, u32) {
    (0, 0)
}

/// Get Unix permission bits from metadata
#[cfg(unix)]
fn get_permissions(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    metadata.permissions().mode() & 0o7777
}

/// Map platform attributes to Unix-like permission bits
#[cfg(not(unix))]
fn get_permissions(metadata: &fs::Metadata) -> u32 {
    let mut mode = if metadata.permissions().readonly() { 0o444 } else { 0o644 };
    if metadata.is_dir() {
        mode |= 0o111;
    }
    mode
}

/// Set Unix permissions
#[cfg(unix)]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let permissions = fs::Permissions::from_mode(mode);
    fs::set_permissions(path, permissions)?;
    Ok(())
}

/// Set permissions (only the read-only flag can be expressed)
#[cfg(not(unix))]
pub fn set_permissions(path: &Path, mode: u32) -> Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(mode & 0o200 == 0);
    fs::set_permissions(path, perms)?;
    Ok(())
}

/// Create a symlink
#[cfg(unix)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    std::os::unix::fs::symlink(target, link)?;
    Ok(())
}

/// Create a symlink (Windows)
#[cfg(windows)]
pub fn create_symlink(target: &Path, link: &Path) -> Result<()> {
    use std::os::windows::fs::{symlink_dir, symlink_file};

    if target.is_dir() {
        symlink_dir(target, link)?;
    } else {
        symlink_file(target, link)?;
    }
    Ok(())
}

/// Make a path relative to a base path
///
/// Tries a lexical strip first so symbolic links keep their own path, and
/// falls back to canonicalizing both sides.
pub fn make_relative(path: &Path, base: &Path) -> Result<PathBuf> {
    if let Ok(relative) = path.strip_prefix(base) {
        return Ok(relative.to_path_buf());
    }

    let path_canon = path.canonicalize()?;
    let base_canon = base.canonicalize()?;

    path_canon
        .strip_prefix(&base_canon)
        .map(|p| p.to_path_buf())
        .map_err(|_| {
            VaultError::internal(format!(
                "Path {:?} is not relative to {:?}",
                path_canon, base_canon
            ))
        })
}

/// Render a relative path as a `/`-separated key
///
/// Keys index the permission maps of backup records, so they must be
/// identical on every platform and distinct for distinct paths. A literal
/// `%` is written as `%25` and bytes that are not valid UTF-8 as `%XX`; every
/// other character is kept as is.
pub fn path_key(relative: &Path) -> String {
    let mut key = String::new();
    for part in relative.components().filter_map(|c| match c {
        Component::Normal(part) => Some(part),
        _ => None,
    }) {
        if !key.is_empty() {
            key.push('/');
        }
        push_key_component(&mut key, part);
    }
    key
}

#[cfg(unix)]
fn push_key_component(key: &mut String, part: &OsStr) {
    use std::os::unix::ffi::OsStrExt;

    for chunk in part.as_bytes().utf8_chunks() {
        key.push_str(&chunk.valid().replace('%', "%25"));
        for byte in chunk.invalid() {
            key.push_str(&format!("%{:02X}", byte));
        }
    }
}

#[cfg(not(unix))]
fn push_key_component(key: &mut String, part: &OsStr) {
    key.push_str(&part.to_string_lossy().replace('%', "%25"));
}

/// Whether a relative path stays inside the directory it is joined to
pub fn is_contained(relative: &Path) -> bool {
    relative
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

/// Format bytes in human-readable form (binary units)
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB", "PB"];
    let mut size = bytes as f64;
    let mut unit_idx = 0;

    while size >= 1024.0 && unit_idx < UNITS.len() - 1 {
        size /= 1024.0;
        unit_idx += 1;
    }

    if unit_idx == 0 {
        format!("{} {}", size as u64, UNITS[unit_idx])
    } else {
        format!("{:.2} {}", size, UNITS[unit_idx])
    }
}

/// Replace `path` with `content` via a temporary file in the same directory
///
/// The target is either the complete new content or untouched.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut temp = tempfile::NamedTempFile::new_in(dir)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| VaultError::Io(e.error))?;

    trace!("Atomically wrote {:?}", path);
    Ok(())
}
