//! Error types for the dirvault library
//!
//! Every fallible operation in the crate returns [`Result`], whose error type
//! [`VaultError`] carries enough context to tell a recoverable condition (a
//! missing source directory, a failed retention deletion, an unparseable
//! schedule) from one that must abort the operation in progress.

use crate::orchestrator::RunStage;
use std::path::PathBuf;
use thiserror::Error;

/// Type alias for Results in the dirvault library
pub type Result<T> = std::result::Result<T, VaultError>;

/// Main error type for all dirvault operations
#[derive(Debug, Error)]
pub enum VaultError {
    /// I/O errors during file operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors during JSON serialization/deserialization
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Missing or invalid job configuration
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// No job with the given name exists in the configuration
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// A run of the job is already in progress in this process
    #[error("Job {0} is already running")]
    JobInProgress(String),

    /// Source directory of a job entry does not exist
    #[error("Source unavailable: {0:?}")]
    SourceUnavailable(PathBuf),

    /// A file inside the source tree could not be read
    #[error("Failed to read source {path:?}: {source}")]
    SourceRead {
        /// Path of the unreadable entry
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// The archive file could not be written
    #[error("Failed to write archive {path:?}: {source}")]
    ArchiveWrite {
        /// Archive path being written
        path: PathBuf,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// An archive could not be read back during restore
    #[error("Failed to read archive {path:?}: {reason}")]
    RestoreRead {
        /// Archive path being read
        path: PathBuf,
        /// What went wrong
        reason: String,
    },

    /// One or more directories of a record failed to restore
    #[error("Restore of {id} incomplete: failed directories {failed:?}")]
    RestoreIncomplete {
        /// Backup record id
        id: String,
        /// Logical names of the directories that failed
        failed: Vec<String>,
    },

    /// Deleting a pruned backup failed
    #[error("Failed to delete backup {id}: {source}")]
    RetentionDeletion {
        /// Backup record id
        id: String,
        /// Underlying I/O error
        source: std::io::Error,
    },

    /// Schedule interval could not be parsed
    #[error("Invalid schedule interval: {0}")]
    ScheduleParse(String),

    /// Backup record not found in any storage path
    #[error("Backup record not found: {0}")]
    RecordNotFound(String),

    /// Hash mismatch during verification
    #[error("Hash mismatch - expected: {expected}, actual: {actual}")]
    HashMismatch {
        /// Expected hash value
        expected: String,
        /// Actual computed hash value
        actual: String,
    },

    /// Every configured directory of a job was unavailable
    #[error("Nothing to back up for job {0}: no source directory was available")]
    EmptyBackup(String),

    /// Operation was cancelled between file operations
    #[error("Operation cancelled")]
    Cancelled,

    /// Quiesce or resume callback failed
    #[error("Service hook error: {0}")]
    Hook(String),

    /// Exclude pattern could not be compiled
    #[error("Invalid exclude pattern: {0}")]
    InvalidPattern(String),

    /// A backup run was aborted; `stage` names the step that failed
    #[error("Backup of job {job} aborted during {stage}: {source}")]
    RunAborted {
        /// Job name
        job: String,
        /// Step that failed
        stage: RunStage,
        /// Cause of the abort
        source: Box<VaultError>,
    },

    /// Generic error for unexpected conditions
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<globset::Error> for VaultError {
    fn from(err: globset::Error) -> Self {
        VaultError::InvalidPattern(err.to_string())
    }
}

impl VaultError {
    /// Create a configuration error with a custom message
    pub fn config(msg: impl Into<String>) -> Self {
        VaultError::Configuration(msg.into())
    }

    /// Create a hook error with a custom message
    pub fn hook(msg: impl Into<String>) -> Self {
        VaultError::Hook(msg.into())
    }

    /// Create an internal error with a custom message
    pub fn internal(msg: impl Into<String>) -> Self {
        VaultError::Internal(msg.into())
    }

    /// Check if this error lets the surrounding operation continue
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            VaultError::SourceUnavailable(_)
                | VaultError::JobInProgress(_)
                | VaultError::RetentionDeletion { .. }
                | VaultError::ScheduleParse(_)
        )
    }

    /// Check if this error indicates corruption
    pub fn is_corruption(&self) -> bool {
        match self {
            VaultError::HashMismatch { .. } | VaultError::RestoreRead { .. } => true,
            VaultError::RunAborted { source, .. } => source.is_corruption(),
            _ => false,
        }
    }

    /// Step of the backup run that failed, if this is a run abort
    pub fn failed_stage(&self) -> Option<RunStage> {
        match self {
            VaultError::RunAborted { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            VaultError::JobNotFound(name) => {
                format!("Job '{}' not found. Check the job names in your configuration file.", name)
            }
            VaultError::RecordNotFound(id) => {
                format!("Backup '{}' not found. Use 'dirvault list <job>' to see available backups.", id)
            }
            VaultError::SourceUnavailable(path) => {
                format!("Source directory {:?} does not exist; it was skipped.", path)
            }
            VaultError::JobInProgress(job) => {
                format!("A backup of job '{}' is already running. Try again once it finishes.", job)
            }
            VaultError::EmptyBackup(job) => {
                format!("None of the directories of job '{}' exist. Nothing was backed up.", job)
            }
            _ => self.to_string(),
        }
    }
}
