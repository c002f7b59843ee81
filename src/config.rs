//! Job configuration sources
//!
//! The engine never parses configuration itself; it asks a [`JobSource`] for
//! the current list of jobs. The scheduler calls [`JobSource::load`] on every
//! tick, so edits to the underlying configuration are picked up without a
//! restart.
//!
//! Two sources ship with the crate:
//!
//! - [`JsonJobFile`] reads a JSON document of the form
//!   `{ "jobs": [...], "hooks": { "quiesce": [...], "resume": [...] } }`.
//! - [`StaticJobSource`] holds jobs in memory and can be swapped at runtime.
//!
//! Both validate every job before handing it out.

use crate::error::{Result, VaultError};
use crate::hooks::CommandHookConfig;
use crate::types::BackupJob;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Source of truth for the configured jobs
pub trait JobSource: Send + Sync {
    /// Load the current job list
    fn load(&self) -> Result<Vec<BackupJob>>;
}

/// On-disk configuration document
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConfigFile {
    /// Configured jobs
    #[serde(default)]
    pub jobs: Vec<BackupJob>,
    /// Quiesce/resume commands
    #[serde(default)]
    pub hooks: CommandHookConfig,
}

impl ConfigFile {
    /// Validate every job and reject duplicate job names
    pub fn validate(&self) -> Result<()> {
        validate_jobs(&self.jobs)
    }
}

fn validate_jobs(jobs: &[BackupJob]) -> Result<()> {
    let mut names = HashSet::new();
    for job in jobs {
        job.validate()?;
        if !names.insert(job.name.as_str()) {
            return Err(VaultError::config(format!("duplicate job name '{}'", job.name)));
        }
    }
    Ok(())
}

/// JSON configuration file
#[derive(Debug, Clone)]
pub struct JsonJobFile {
    path: PathBuf,
}

impl JsonJobFile {
    /// Source backed by the file at `path`
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the configuration file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read and validate the whole document
    pub fn read(&self) -> Result<ConfigFile> {
        if !self.path.is_file() {
            return Err(VaultError::config(format!(
                "configuration file {:?} not found",
                self.path
            )));
        }
        let bytes = fs::read(&self.path)?;
        let config: ConfigFile = serde_json::from_slice(&bytes)
            .map_err(|e| VaultError::config(format!("{:?}: {}", self.path, e)))?;
        config.validate()?;
        debug!("Loaded {} jobs from {:?}", config.jobs.len(), self.path);
        Ok(config)
    }
}

impl JobSource for JsonJobFile {
    fn load(&self) -> Result<Vec<BackupJob>> {
        Ok(self.read()?.jobs)
    }
}

/// In-memory job list
#[derive(Debug, Default)]
pub struct StaticJobSource {
    jobs: RwLock<Vec<BackupJob>>,
}

impl StaticJobSource {
    /// Source holding `jobs`
    pub fn new(jobs: Vec<BackupJob>) -> Self {
        Self {
            jobs: RwLock::new(jobs),
        }
    }

    /// Replace the job list; takes effect on the next load
    pub fn replace(&self, jobs: Vec<BackupJob>) {
        *self.jobs.write() = jobs;
    }
}

impl JobSource for StaticJobSource {
    fn load(&self) -> Result<Vec<BackupJob>> {
        let jobs = self.jobs.read().clone();
        validate_jobs(&jobs)?;
        Ok(jobs)
    }
}
