//! # dirvault - Checksummed directory backups
//!
//! A backup engine that archives directory trees into tar bundles, tracks
//! them as backup records, prunes them by retention policy, restores them on
//! demand and runs jobs on a background schedule.
//!
//! ## Overview
//!
//! dirvault lets you:
//! - Archive one or more directories per job into `.tar` or `.tar.gz` files
//! - Record size, file count, permissions and SHA-256 checksums of every backup
//! - Restore a backup to its original location or anywhere else
//! - Keep backups by age, by count and one per month
//! - Pause external services around the archive window
//! - Run every job on its own interval from one scheduler loop
//!
//! Each backup is a full, independent snapshot. There is no deduplication,
//! no incremental archiving and no encryption.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use dirvault::{BackupEngine, BackupJob, DirectoryEntry, RetentionPolicy, StorageTarget};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = BackupEngine::builder()
//!     .jobs(vec![BackupJob {
//!         name: "nightly".to_string(),
//!         directories: vec![
//!             DirectoryEntry::new("/srv/app/data", "data"),
//!             DirectoryEntry::new("/srv/app/config", "config").compressed(true),
//!         ],
//!         retention: RetentionPolicy { keep_days: 30, keep_count: 10, keep_monthly: 1 },
//!         storage: StorageTarget::local("/backups/nightly"),
//!         ..Default::default()
//!     }])
//!     .build()?;
//!
//! // Back up now
//! let record = engine.run_job("nightly")?;
//! println!("Created {} ({} bytes)", record.id, record.total_size);
//!
//! // Restore somewhere else
//! let report = engine.restore_record(&record.id, Some("/tmp/restore".as_ref()))?;
//! println!("Restored {} files", report.files_restored());
//! # Ok(())
//! # }
//! ```
//!
//! ## Storage Layout
//!
//! ```text
//! <storage-path>/<job>-<YYYYmmdd-HHMMSS-micros>/
//!     <logical-name>.tar[.gz]
//!     metadata.json
//! ```
//!
//! ## Module Organization
//!
//! - [`engine`]: Entry points and builder
//! - [`orchestrator`]: One backup run, stage by stage
//! - [`archive`] / [`restore`]: Tar writing and extraction
//! - [`metadata`]: Record persistence
//! - [`retention`]: Retention evaluation and pruning
//! - [`scheduler`]: Background tick loop
//! - [`config`] / [`hooks`]: Job sources and quiesce/resume commands
//! - [`verification`]: Integrity checking
//! - [`types`] / [`record`]: Data model
//! - [`error`]: Error types

pub mod archive;
pub mod config;
pub mod engine;
pub mod error;
pub mod hooks;
pub mod metadata;
pub mod orchestrator;
pub mod record;
pub mod restore;
pub mod retention;
pub mod scheduler;
pub mod types;
pub mod utils;
pub mod verification;

// Re-export main types for convenience
pub use archive::Archiver;
pub use config::{ConfigFile, JobSource, JsonJobFile, StaticJobSource};
pub use engine::{BackupEngine, BackupEngineBuilder};
pub use error::{Result, VaultError};
pub use hooks::{CommandHookConfig, CommandServiceHook};
pub use metadata::MetadataStore;
pub use orchestrator::{BackupOrchestrator, JobRunner, NoOpServiceHook, RunStage, ServiceHook, StorageResolver};
pub use record::{BackupRecord, DirectoryRecord, FilePermissionRecord};
pub use restore::{RestoreReport, Restorer};
pub use retention::PruneReport;
pub use scheduler::{RunningJobs, Scheduler};
pub use types::*;
pub use verification::VerificationReport;
