//! Main entry points
//!
//! [`BackupEngine`] ties the pieces together: it reads jobs from a
//! [`JobSource`], runs them through a [`BackupOrchestrator`], lists, restores,
//! prunes and verifies their records, and owns the background [`Scheduler`].
//! Every call a front-end needs is a plain method here.
//!
//! A job never runs twice at once: manual runs and scheduled runs mark the
//! same [`RunningJobs`] set, and a run that finds its job already marked is
//! refused with [`VaultError::JobInProgress`].
//!
//! [`BackupEngine::cancel`] aborts the runs and restores in progress when it
//! is called. Each operation works under its own child of the engine's
//! current cancellation token, and cancelling swaps in a fresh parent, so
//! later operations start unaffected.
//!
//! ## Example
//!
//! ```rust,no_run
//! use dirvault::BackupEngine;
//! use dirvault::config::JsonJobFile;
//! use std::sync::Arc;
//!
//! # fn main() -> dirvault::Result<()> {
//! let engine = BackupEngine::builder()
//!     .job_source(Arc::new(JsonJobFile::new("dirvault.json")))
//!     .build()?;
//!
//! let record = engine.run_job("nightly")?;
//! println!("created {}", record.id);
//!
//! for record in engine.list_records("nightly")? {
//!     println!("{} {}", record.id, record.timestamp);
//! }
//!
//! engine.restore_record(&record.id, Some("/tmp/restore-here".as_ref()))?;
//! # Ok(())
//! # }
//! ```

use crate::archive::Archiver;
use crate::config::{JobSource, StaticJobSource};
use crate::error::{Result, VaultError};
use crate::metadata::MetadataStore;
use crate::orchestrator::{
    BackupOrchestrator, DefaultStorageResolver, JobRunner, NoOpServiceHook, ServiceHook, StorageResolver,
};
use crate::record::BackupRecord;
use crate::restore::{RestoreReport, Restorer};
use crate::retention::{self, PruneReport};
use crate::scheduler::{RunningJobs, Scheduler};
use crate::types::BackupJob;
use crate::verification::{RecordVerifier, VerificationReport};
use chrono::Utc;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Default scheduler tick
pub const DEFAULT_TICK: Duration = Duration::from_secs(60);

/// Hands out per-operation cancellation tokens
#[derive(Debug, Default)]
struct CancelScope {
    current: Mutex<CancellationToken>,
}

impl CancelScope {
    /// Token for one operation; fires when [`cancel_all`](Self::cancel_all) runs
    fn token(&self) -> CancellationToken {
        self.current.lock().child_token()
    }

    /// Cancel every token handed out so far
    fn cancel_all(&self) {
        let previous = std::mem::take(&mut *self.current.lock());
        previous.cancel();
    }
}

/// What the scheduler runs: the orchestrator under a fresh token per run
struct ScopedRunner {
    orchestrator: Arc<BackupOrchestrator>,
    scope: Arc<CancelScope>,
}

impl JobRunner for ScopedRunner {
    fn run(&self, job: &BackupJob) -> Result<BackupRecord> {
        self.orchestrator.run_with(job, &self.scope.token())
    }
}

/// Backup engine: jobs in, records out
pub struct BackupEngine {
    source: Arc<dyn JobSource>,
    orchestrator: Arc<BackupOrchestrator>,
    restorer: Restorer,
    tick: Duration,
    scheduler: Mutex<Option<Arc<Scheduler>>>,
    running: RunningJobs,
    scope: Arc<CancelScope>,
}

impl std::fmt::Debug for BackupEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupEngine")
            .field("orchestrator", &self.orchestrator)
            .field("restorer", &self.restorer)
            .field("tick", &self.tick)
            .field("running", &self.running.names())
            .finish_non_exhaustive()
    }
}

impl BackupEngine {
    /// Start building an engine
    pub fn builder() -> BackupEngineBuilder {
        BackupEngineBuilder::new()
    }

    /// Currently configured jobs
    pub fn jobs(&self) -> Result<Vec<BackupJob>> {
        self.source.load()
    }

    /// Look up one job by name
    ///
    /// # Errors
    ///
    /// [`VaultError::JobNotFound`] if no job has that name.
    pub fn job(&self, name: &str) -> Result<BackupJob> {
        self.jobs()?
            .into_iter()
            .find(|j| j.name == name)
            .ok_or_else(|| VaultError::JobNotFound(name.to_string()))
    }

    /// Run one backup of the named job on the calling thread
    ///
    /// # Errors
    ///
    /// [`VaultError::JobInProgress`] if a run of the job, manual or
    /// scheduled, has not finished yet.
    #[instrument(skip(self))]
    pub fn run_job(&self, name: &str) -> Result<BackupRecord> {
        let job = self.job(name)?;
        self.run_exclusive(&job)
    }

    fn run_exclusive(&self, job: &BackupJob) -> Result<BackupRecord> {
        // Token first: once the job shows as running, cancel() must reach it
        let cancel = self.scope.token();
        let _guard = self
            .running
            .try_acquire(&job.name, Utc::now())
            .ok_or_else(|| VaultError::JobInProgress(job.name.clone()))?;
        self.orchestrator.run_with(job, &cancel)
    }

    /// Run every enabled job in turn
    ///
    /// A failing job does not stop the others; its error is collected.
    pub fn run_all_enabled_jobs(&self) -> (Vec<BackupRecord>, Vec<VaultError>) {
        let jobs = match self.jobs() {
            Ok(jobs) => jobs,
            Err(e) => return (Vec::new(), vec![e]),
        };

        let mut records = Vec::new();
        let mut errors = Vec::new();
        for job in jobs.iter().filter(|j| j.enabled) {
            match self.run_exclusive(job) {
                Ok(record) => records.push(record),
                Err(e) => {
                    error!("Backup of {} failed: {}", job.name, e);
                    errors.push(e);
                }
            }
        }
        info!("Ran {} jobs: {} succeeded, {} failed", records.len() + errors.len(), records.len(), errors.len());
        (records, errors)
    }

    /// Records of the named job, newest first
    pub fn list_records(&self, name: &str) -> Result<Vec<BackupRecord>> {
        let job = self.job(name)?;
        self.store_for(&job)?.list(&job.name)
    }

    /// Find a record by id across all configured jobs
    pub fn find_record(&self, id: &str) -> Result<(BackupJob, MetadataStore, BackupRecord)> {
        for job in self.jobs()? {
            if !id.starts_with(&format!("{}-", job.name)) {
                continue;
            }
            let store = match self.store_for(&job) {
                Ok(store) => store,
                Err(e) => {
                    debug!("Skipping storage of {}: {}", job.name, e);
                    continue;
                }
            };
            if store.contains(id) {
                let record = store.load(id)?;
                if record.belongs_to(&job.name) {
                    return Ok((job, store, record));
                }
            }
        }
        Err(VaultError::RecordNotFound(id.to_string()))
    }

    /// Restore every directory of a backup
    ///
    /// Each directory goes back to its original source path, or to
    /// `<target_override>/<logical-name>` when an override is given. A
    /// directory that fails does not stop the others.
    ///
    /// # Errors
    ///
    /// [`VaultError::RecordNotFound`] if the id is unknown, and
    /// [`VaultError::RestoreIncomplete`] naming the failed directories if any
    /// directory could not be restored.
    #[instrument(skip(self))]
    pub fn restore_record(&self, id: &str, target_override: Option<&Path>) -> Result<RestoreReport> {
        let (_, store, record) = self.find_record(id)?;
        let run_dir = store.run_dir(&record.id);
        let cancel = self.scope.token();
        let mut report = RestoreReport {
            id: record.id.clone(),
            ..Default::default()
        };

        for dir in &record.directories {
            let target = match target_override {
                Some(base) => base.join(&dir.name),
                None => dir.path.clone(),
            };
            let archive = run_dir.join(dir.archive_file_name());

            match self.restorer.restore(dir, &archive, &target, &cancel) {
                Ok(restored) => {
                    for warning in &restored.warnings {
                        warn!("{}: {}", dir.name, warning);
                    }
                    report.restored.push(restored);
                }
                Err(e) => {
                    error!("Restoring {} of {} failed: {}", dir.name, record.id, e);
                    report.failed.push((dir.name.clone(), e.to_string()));
                }
            }
        }

        if report.is_complete() {
            info!("Restored {} ({} files)", record.id, report.files_restored());
            Ok(report)
        } else {
            Err(VaultError::RestoreIncomplete {
                id: record.id,
                failed: report.failed.into_iter().map(|(name, _)| name).collect(),
            })
        }
    }

    /// Apply the named job's retention policy now
    pub fn cleanup(&self, name: &str) -> Result<PruneReport> {
        let job = self.job(name)?;
        let store = self.store_for(&job)?;
        let records = store.list(&job.name)?;
        Ok(retention::prune(&store, &records, &job.retention, Utc::now()))
    }

    /// Re-hash the archives of a backup and compare them with its record
    pub fn verify_record(&self, id: &str) -> Result<VerificationReport> {
        let (_, store, record) = self.find_record(id)?;
        Ok(RecordVerifier::new(&store).verify(&record))
    }

    /// Start the background scheduler
    ///
    /// Must be called from within a Tokio runtime. Calling it while a
    /// scheduler is running does nothing.
    pub fn start_scheduler(&self) -> Result<Arc<Scheduler>> {
        let mut slot = self.scheduler.lock();
        if let Some(scheduler) = slot.as_ref() {
            return Ok(Arc::clone(scheduler));
        }

        let runner = Arc::new(ScopedRunner {
            orchestrator: Arc::clone(&self.orchestrator),
            scope: Arc::clone(&self.scope),
        });
        let scheduler = Arc::new(Scheduler::sharing(
            Arc::clone(&self.source),
            runner,
            self.tick,
            self.running.clone(),
        )?);
        scheduler.start()?;
        *slot = Some(Arc::clone(&scheduler));
        Ok(scheduler)
    }

    /// Stop the background scheduler, leaving in-flight runs alone
    pub async fn stop_scheduler(&self) {
        let scheduler = self.scheduler.lock().take();
        if let Some(scheduler) = scheduler {
            scheduler.stop().await;
        }
    }

    /// Running scheduler, if any
    pub fn scheduler(&self) -> Option<Arc<Scheduler>> {
        self.scheduler.lock().clone()
    }

    /// Names of jobs with a run in progress, manual or scheduled, sorted
    pub fn running_jobs(&self) -> Vec<String> {
        self.running.names()
    }

    /// Abort the archiving and restoring in progress between file operations
    ///
    /// Only operations already started are affected; the engine stays usable.
    pub fn cancel(&self) {
        info!("Cancelling operations in progress");
        self.scope.cancel_all();
    }

    fn store_for(&self, job: &BackupJob) -> Result<MetadataStore> {
        Ok(MetadataStore::new(self.orchestrator.storage_path(job)?))
    }
}

/// Builder for [`BackupEngine`]
///
/// # Defaults
///
/// - job source: empty [`StaticJobSource`]
/// - hook: [`NoOpServiceHook`]
/// - storage resolver: [`DefaultStorageResolver`]
/// - follow symlinks: false
/// - verify archives before restoring: true
/// - scheduler tick: one minute
pub struct BackupEngineBuilder {
    source: Option<Arc<dyn JobSource>>,
    hook: Arc<dyn ServiceHook>,
    resolver: Arc<dyn StorageResolver>,
    follow_symlinks: bool,
    verify_before_restore: bool,
    tick: Duration,
}

impl Default for BackupEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl BackupEngineBuilder {
    /// Builder with default settings
    pub fn new() -> Self {
        Self {
            source: None,
            hook: Arc::new(NoOpServiceHook),
            resolver: Arc::new(DefaultStorageResolver),
            follow_symlinks: false,
            verify_before_restore: true,
            tick: DEFAULT_TICK,
        }
    }

    /// Read jobs from `source`
    pub fn job_source(mut self, source: Arc<dyn JobSource>) -> Self {
        self.source = Some(source);
        self
    }

    /// Use a fixed in-memory job list
    ///
    /// ```rust
    /// use dirvault::BackupEngine;
    /// use dirvault::types::{BackupJob, DirectoryEntry, StorageTarget};
    ///
    /// let engine = BackupEngine::builder()
    ///     .jobs(vec![BackupJob {
    ///         name: "docs".to_string(),
    ///         directories: vec![DirectoryEntry::new("/home/me/docs", "docs")],
    ///         storage: StorageTarget::local("/backups/docs"),
    ///         ..Default::default()
    ///     }])
    ///     .build()
    ///     .unwrap();
    /// assert_eq!(engine.jobs().unwrap().len(), 1);
    /// ```
    pub fn jobs(self, jobs: Vec<BackupJob>) -> Self {
        self.job_source(Arc::new(StaticJobSource::new(jobs)))
    }

    /// Quiesce/resume collaborator
    pub fn hook(mut self, hook: Arc<dyn ServiceHook>) -> Self {
        self.hook = hook;
        self
    }

    /// Storage path resolution
    pub fn storage_resolver(mut self, resolver: Arc<dyn StorageResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Archive symlink targets instead of the links themselves
    pub fn follow_symlinks(mut self, follow: bool) -> Self {
        self.follow_symlinks = follow;
        self
    }

    /// Check archive checksums before extracting
    pub fn verify_before_restore(mut self, verify: bool) -> Self {
        self.verify_before_restore = verify;
        self
    }

    /// Scheduler tick period
    pub fn tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    /// Build the engine
    ///
    /// # Errors
    ///
    /// [`VaultError::Configuration`] if the tick is zero.
    pub fn build(self) -> Result<BackupEngine> {
        if self.tick.is_zero() {
            return Err(VaultError::config("scheduler tick must be positive"));
        }

        let archiver = Archiver::new().follow_symlinks(self.follow_symlinks);
        let orchestrator = BackupOrchestrator::new(archiver, self.hook, self.resolver);

        Ok(BackupEngine {
            source: self
                .source
                .unwrap_or_else(|| Arc::new(StaticJobSource::default())),
            orchestrator: Arc::new(orchestrator),
            restorer: Restorer::new().verify_checksum(self.verify_before_restore),
            tick: self.tick,
            scheduler: Mutex::new(None),
            running: RunningJobs::new(),
            scope: Arc::new(CancelScope::default()),
        })
    }
}
