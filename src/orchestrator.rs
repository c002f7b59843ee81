//! Backup run orchestration
//!
//! [`BackupOrchestrator::run`] drives one backup of one job through a fixed
//! sequence of stages:
//!
//! ```text
//! Quiesce -> Storage -> Archive -> Record -> Resume -> Prune -> Done
//!    \__________\__________\_________\________________________ Aborted
//! ```
//!
//! - **Quiesce**: unless the job skips it, the [`ServiceHook`] pauses external
//!   services and hands back opaque tokens.
//! - **Storage**: the [`StorageResolver`] maps the job to a directory and a
//!   fresh run directory is reserved under it.
//! - **Archive**: every [`DirectoryEntry`](crate::types::DirectoryEntry) is
//!   archived. Missing sources are skipped with a warning; any other failure
//!   aborts the run.
//! - **Record**: the [`BackupRecord`] is assembled and persisted.
//! - **Resume**: the hook gets its tokens back. This step runs whether or not
//!   the earlier steps succeeded, and its failures are only logged.
//! - **Prune**: retention is applied to the job's records. Deletion failures
//!   are logged and never fail the run.
//!
//! An aborted run removes its partial run directory and returns
//! [`VaultError::RunAborted`] naming the stage that failed.

use crate::archive::Archiver;
use crate::error::{Result, VaultError};
use crate::metadata::MetadataStore;
use crate::record::BackupRecord;
use crate::retention;
use crate::types::{BackupJob, StorageKind};
use chrono::Utc;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

/// Step of a backup run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunStage {
    /// Pausing external services
    Quiesce,
    /// Resolving the storage path and reserving the run directory
    Storage,
    /// Archiving the configured directories
    Archive,
    /// Persisting the backup record
    Record,
    /// Resuming external services
    Resume,
    /// Applying retention
    Prune,
    /// Run finished
    Done,
}

impl fmt::Display for RunStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RunStage::Quiesce => "quiesce",
            RunStage::Storage => "storage",
            RunStage::Archive => "archive",
            RunStage::Record => "record",
            RunStage::Resume => "resume",
            RunStage::Prune => "prune",
            RunStage::Done => "done",
        };
        f.write_str(name)
    }
}

/// Opaque value returned by [`ServiceHook::quiesce`] and handed back on resume
pub type QuiesceToken = String;

/// Pause/resume callbacks bracketing the archive window
///
/// Implementations typically stop containers or flush databases. The engine
/// never looks inside the tokens.
pub trait ServiceHook: Send + Sync {
    /// Pause whatever must be quiet while `job` is archived
    fn quiesce(&self, job: &BackupJob) -> Result<Vec<QuiesceToken>>;

    /// Undo a previous [`quiesce`](ServiceHook::quiesce)
    fn resume(&self, job: &BackupJob, tokens: &[QuiesceToken]) -> Result<()>;
}

/// Hook that does nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoOpServiceHook;

impl ServiceHook for NoOpServiceHook {
    fn quiesce(&self, _job: &BackupJob) -> Result<Vec<QuiesceToken>> {
        Ok(Vec::new())
    }

    fn resume(&self, _job: &BackupJob, _tokens: &[QuiesceToken]) -> Result<()> {
        Ok(())
    }
}

/// Maps a job to the directory its backups live in
pub trait StorageResolver: Send + Sync {
    /// Resolve (and if appropriate create) the storage path of `job`
    fn resolve(&self, job: &BackupJob) -> Result<PathBuf>;
}

/// Local directories are created on demand; remote mounts must already exist
///
/// Mounting remote storage is somebody else's job. A remote target whose
/// mount point is missing is a configuration error rather than something to
/// paper over by writing to an unmounted directory.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultStorageResolver;

impl StorageResolver for DefaultStorageResolver {
    fn resolve(&self, job: &BackupJob) -> Result<PathBuf> {
        match (&job.storage.kind, &job.storage.remote) {
            (StorageKind::Remote, Some(remote)) if !job.skip_remote => {
                if !remote.mount_point.is_dir() {
                    return Err(VaultError::config(format!(
                        "remote storage for job '{}' is not mounted at {:?}",
                        job.name, remote.mount_point
                    )));
                }
                debug!("Using remote mount {:?} ({})", remote.mount_point, remote.bucket);
                Ok(remote.mount_point.clone())
            }
            (StorageKind::Remote, None) if !job.skip_remote => Err(VaultError::config(format!(
                "job '{}' uses remote storage but has no bucket reference",
                job.name
            ))),
            _ => {
                fs::create_dir_all(&job.storage.local_path)?;
                Ok(job.storage.local_path.clone())
            }
        }
    }
}

/// Anything that can run a job to completion
///
/// The scheduler depends on this rather than on the orchestrator directly.
pub trait JobRunner: Send + Sync {
    /// Run one backup of `job`
    fn run(&self, job: &BackupJob) -> Result<BackupRecord>;
}

/// Runs backup jobs end to end
#[derive(Clone)]
pub struct BackupOrchestrator {
    archiver: Archiver,
    hook: Arc<dyn ServiceHook>,
    resolver: Arc<dyn StorageResolver>,
}

impl fmt::Debug for BackupOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BackupOrchestrator")
            .field("archiver", &self.archiver)
            .finish_non_exhaustive()
    }
}

impl Default for BackupOrchestrator {
    fn default() -> Self {
        Self::new(Archiver::new(), Arc::new(NoOpServiceHook), Arc::new(DefaultStorageResolver))
    }
}

impl BackupOrchestrator {
    /// Create an orchestrator from its collaborators
    pub fn new(archiver: Archiver, hook: Arc<dyn ServiceHook>, resolver: Arc<dyn StorageResolver>) -> Self {
        Self { archiver, hook, resolver }
    }

    /// Storage path of `job`, as the resolver sees it
    pub fn storage_path(&self, job: &BackupJob) -> Result<PathBuf> {
        self.resolver.resolve(job)
    }

    /// Run one backup of `job` that nothing can cancel
    pub fn run(&self, job: &BackupJob) -> Result<BackupRecord> {
        self.run_with(job, &CancellationToken::new())
    }

    /// Run one backup of `job`, aborting the archive stage once `cancel` fires
    ///
    /// The token only lives as long as the caller wants; cancelling it does
    /// not affect later runs that are handed a different token.
    ///
    /// # Returns
    ///
    /// The persisted [`BackupRecord`].
    ///
    /// # Errors
    ///
    /// Configuration errors are returned as they are. Everything after
    /// validation is wrapped in [`VaultError::RunAborted`] with the failing
    /// [`RunStage`].
    #[instrument(skip(self, job, cancel), fields(job = %job.name))]
    pub fn run_with(&self, job: &BackupJob, cancel: &CancellationToken) -> Result<BackupRecord> {
        job.validate()?;
        info!("Starting backup of {}", job.label());

        let quiesce = !job.skip_quiesce;
        let tokens = if quiesce {
            self.hook
                .quiesce(job)
                .map_err(|e| aborted(job, RunStage::Quiesce, e))?
        } else {
            Vec::new()
        };
        debug!("Quiesced with {} tokens", tokens.len());

        let outcome = self.archive_and_record(job, cancel);

        if quiesce {
            if let Err(e) = self.hook.resume(job, &tokens) {
                warn!("Resume after backup of {} failed: {}", job.name, e);
            }
        }

        let (record, store) = outcome?;

        match store.list(&job.name) {
            Ok(records) => {
                let report = retention::prune(&store, &records, &job.retention, Utc::now());
                if !report.failures.is_empty() {
                    warn!("{} backups of {} could not be pruned", report.failures.len(), job.name);
                }
            }
            Err(e) => warn!("Skipping retention for {}: {}", job.name, e),
        }

        info!(
            "Backup {} complete ({} directories, {} files)",
            record.id,
            record.directories.len(),
            record.file_count()
        );
        Ok(record)
    }

    fn archive_and_record(
        &self,
        job: &BackupJob,
        cancel: &CancellationToken,
    ) -> Result<(BackupRecord, MetadataStore)> {
        let storage = self
            .resolver
            .resolve(job)
            .map_err(|e| aborted(job, RunStage::Storage, e))?;
        let store = MetadataStore::new(storage);
        let (id, timestamp, run_dir) = store
            .reserve(&job.name, Utc::now())
            .map_err(|e| aborted(job, RunStage::Storage, e))?;

        let mut directories = Vec::with_capacity(job.directories.len());
        for entry in &job.directories {
            match self.archiver.archive(entry, &run_dir, cancel) {
                Ok(output) => directories.push(output.record),
                Err(VaultError::SourceUnavailable(path)) => {
                    warn!("Source {:?} of {} is unavailable, skipping", path, job.name);
                }
                Err(e) => {
                    store.discard(&run_dir);
                    return Err(aborted(job, RunStage::Archive, e));
                }
            }
        }

        if directories.is_empty() {
            store.discard(&run_dir);
            return Err(aborted(job, RunStage::Archive, VaultError::EmptyBackup(job.name.clone())));
        }

        let record = BackupRecord::new(job.name.clone(), id, timestamp, directories);
        if let Err(e) = store.save(&record) {
            store.discard(&run_dir);
            return Err(aborted(job, RunStage::Record, e));
        }

        Ok((record, store))
    }
}

impl JobRunner for BackupOrchestrator {
    fn run(&self, job: &BackupJob) -> Result<BackupRecord> {
        BackupOrchestrator::run(self, job)
    }
}

fn aborted(job: &BackupJob, stage: RunStage, source: VaultError) -> VaultError {
    VaultError::RunAborted {
        job: job.name.clone(),
        stage,
        source: Box::new(source),
    }
}
