//! Background scheduling of backup jobs
//!
//! The [`Scheduler`] runs a single loop on a fixed tick, independent of any
//! job's own interval. Each tick it:
//!
//! 1. Reloads the job list from its [`JobSource`] on the blocking thread pool.
//!    A failed reload keeps the previous list; a successful one forgets the
//!    last-run times of jobs that are gone.
//! 2. Computes which enabled jobs are due: never run since the scheduler
//!    started, or at least one interval since the last launch.
//! 3. Launches every due job on the blocking thread pool and records the tick
//!    time as its last run.
//!
//! A job whose previous run is still in flight is never launched again until
//! that run finishes, even if its interval has elapsed. The set of running
//! jobs is a [`RunningJobs`] handle that can be shared with other callers
//! (the engine's manual runs use the same one), so a job never runs twice at
//! once regardless of who started it.
//!
//! ## Intervals
//!
//! Schedule intervals are either durations understood by `humantime`
//! (`"90m"`, `"2h 30m"`, `"1day"`) or one of the aliases `hourly`, `daily`,
//! `weekly`, `monthly` (30 days), `15min` / `quarter-hourly`, `30min` /
//! `half-hourly`. Anything else falls back to 24 hours with a warning.
//!
//! ## Lifecycle
//!
//! ```rust,no_run
//! use dirvault::config::StaticJobSource;
//! use dirvault::orchestrator::BackupOrchestrator;
//! use dirvault::scheduler::Scheduler;
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! # async fn example() -> dirvault::Result<()> {
//! let scheduler = Scheduler::new(
//!     Arc::new(StaticJobSource::new(vec![])),
//!     Arc::new(BackupOrchestrator::default()),
//!     Duration::from_secs(60),
//! )?;
//! scheduler.start()?;
//! // ...
//! scheduler.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! Stopping halts the tick loop only. Runs already in flight finish on their
//! own; [`Scheduler::wait_idle`] waits for them.

use crate::config::JobSource;
use crate::error::{Result, VaultError};
use crate::orchestrator::JobRunner;
use crate::types::{BackupJob, Schedule};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Interval used when a schedule cannot be parsed
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(24 * 60 * 60);

const HOUR: u64 = 60 * 60;

/// Parse a schedule interval
///
/// # Errors
///
/// [`VaultError::ScheduleParse`] for unknown words, malformed durations and
/// zero-length intervals.
pub fn parse_interval(interval: &str) -> Result<Duration> {
    let normalized = interval.trim().to_ascii_lowercase();
    let alias = match normalized.as_str() {
        "hourly" => Some(HOUR),
        "daily" => Some(24 * HOUR),
        "weekly" => Some(7 * 24 * HOUR),
        "monthly" => Some(30 * 24 * HOUR),
        "15min" | "quarter-hourly" => Some(15 * 60),
        "30min" | "half-hourly" => Some(30 * 60),
        _ => None,
    };
    if let Some(secs) = alias {
        return Ok(Duration::from_secs(secs));
    }

    let parsed = humantime::parse_duration(&normalized)
        .map_err(|e| VaultError::ScheduleParse(format!("'{}': {}", interval, e)))?;
    if parsed.is_zero() {
        return Err(VaultError::ScheduleParse(format!("'{}': interval must be positive", interval)));
    }
    Ok(parsed)
}

/// Interval of `schedule`, falling back to [`DEFAULT_INTERVAL`] with a warning
pub fn effective_interval(schedule: &Schedule) -> Duration {
    parse_interval(&schedule.interval).unwrap_or_else(|e| {
        warn!("{}; falling back to {}", e, humantime::format_duration(DEFAULT_INTERVAL));
        DEFAULT_INTERVAL
    })
}

/// Whether a job last launched at `last_run` is due at `now`
pub fn is_due(last_run: Option<DateTime<Utc>>, now: DateTime<Utc>, interval: Duration) -> bool {
    match last_run {
        None => true,
        Some(last) => match (now - last).to_std() {
            Ok(elapsed) => elapsed >= interval,
            // Clock went backwards
            Err(_) => false,
        },
    }
}

#[derive(Debug, Default)]
struct SchedulerState {
    jobs: Vec<BackupJob>,
    last_run: HashMap<String, DateTime<Utc>>,
}

/// Jobs with a run in progress, keyed by name, with their start times
///
/// Cloning shares the underlying set.
#[derive(Debug, Clone, Default)]
pub struct RunningJobs {
    jobs: Arc<DashMap<String, DateTime<Utc>>>,
}

impl RunningJobs {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `job` as running since `now`
    ///
    /// Returns `None` if the job is already running. The job stays marked
    /// until the returned guard is dropped.
    pub fn try_acquire(&self, job: &str, now: DateTime<Utc>) -> Option<RunGuard> {
        match self.jobs.entry(job.to_string()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(slot) => {
                slot.insert(now);
                Some(RunGuard {
                    jobs: Arc::clone(&self.jobs),
                    job: job.to_string(),
                })
            }
        }
    }

    /// Whether `job` has a run in progress
    pub fn contains(&self, job: &str) -> bool {
        self.jobs.contains_key(job)
    }

    /// Start time of the run of `job` in progress
    pub fn started_at(&self, job: &str) -> Option<DateTime<Utc>> {
        self.jobs.get(job).map(|e| *e.value())
    }

    /// Whether nothing is running
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    /// Names of running jobs, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.jobs.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }
}

/// Removes a job from its [`RunningJobs`] set when dropped, however the run ends
#[derive(Debug)]
pub struct RunGuard {
    jobs: Arc<DashMap<String, DateTime<Utc>>>,
    job: String,
}

impl RunGuard {
    /// Name of the guarded job
    pub fn job(&self) -> &str {
        &self.job
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        self.jobs.remove(&self.job);
    }
}

struct SchedulerInner {
    source: Arc<dyn JobSource>,
    runner: Arc<dyn JobRunner>,
    tick: Duration,
    state: Mutex<SchedulerState>,
    running: RunningJobs,
    shutdown: CancellationToken,
}

impl SchedulerInner {
    fn apply_reload(&self, loaded: Result<Vec<BackupJob>>) {
        match loaded {
            Ok(jobs) => {
                debug!("Reloaded {} jobs", jobs.len());
                let mut state = self.state.lock();
                state.last_run.retain(|name, _| jobs.iter().any(|j| &j.name == name));
                state.jobs = jobs;
            }
            Err(e) => warn!("Job reload failed, keeping previous configuration: {}", e),
        }
    }

    /// Reload on the blocking pool so file reads never stall a runtime worker
    async fn reload_blocking(&self) -> Result<Vec<BackupJob>> {
        let source = Arc::clone(&self.source);
        tokio::task::spawn_blocking(move || source.load())
            .await
            .map_err(|e| VaultError::internal(format!("job reload task failed: {}", e)))?
    }

    #[instrument(skip(self, loaded))]
    fn launch_due(&self, loaded: Result<Vec<BackupJob>>, now: DateTime<Utc>) -> Vec<String> {
        self.apply_reload(loaded);

        let due: Vec<(BackupJob, RunGuard)> = {
            let mut state = self.state.lock();
            let SchedulerState { jobs, last_run } = &mut *state;
            let mut due = Vec::new();

            for job in jobs.iter().filter(|j| j.is_schedulable()) {
                let interval = effective_interval(&job.schedule);
                if !is_due(last_run.get(&job.name).copied(), now, interval) {
                    continue;
                }
                match self.running.try_acquire(&job.name, now) {
                    None => {
                        warn!("Skipping scheduled run of {}: previous run still in progress", job.name);
                    }
                    Some(guard) => {
                        last_run.insert(job.name.clone(), now);
                        due.push((job.clone(), guard));
                    }
                }
            }
            due
        };

        let mut launched = Vec::with_capacity(due.len());
        for (job, guard) in due {
            let runner = Arc::clone(&self.runner);
            launched.push(job.name.clone());

            info!("Launching scheduled backup of {}", job.name);
            tokio::task::spawn_blocking(move || {
                let _guard = guard;
                match runner.run(&job) {
                    Ok(record) => info!("Scheduled backup {} finished", record.id),
                    Err(e) => error!("Scheduled backup of {} failed: {}", job.name, e),
                }
            });
        }
        launched
    }
}

/// Tick-driven background scheduler
pub struct Scheduler {
    inner: Arc<SchedulerInner>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field("tick", &self.inner.tick)
            .field("running", &self.is_running())
            .field("in_flight", &self.running_jobs())
            .finish()
    }
}

impl Scheduler {
    /// Create a stopped scheduler with its own set of running jobs
    ///
    /// # Errors
    ///
    /// [`VaultError::Configuration`] if `tick` is zero.
    pub fn new(source: Arc<dyn JobSource>, runner: Arc<dyn JobRunner>, tick: Duration) -> Result<Self> {
        Self::sharing(source, runner, tick, RunningJobs::new())
    }

    /// Create a stopped scheduler that skips jobs marked in `running`
    ///
    /// Runs it launches are marked in the same set, so whoever else holds
    /// `running` sees them too.
    pub fn sharing(
        source: Arc<dyn JobSource>,
        runner: Arc<dyn JobRunner>,
        tick: Duration,
        running: RunningJobs,
    ) -> Result<Self> {
        if tick.is_zero() {
            return Err(VaultError::config("scheduler tick must be positive"));
        }
        Ok(Self {
            inner: Arc::new(SchedulerInner {
                source,
                runner,
                tick,
                state: Mutex::new(SchedulerState::default()),
                running,
                shutdown: CancellationToken::new(),
            }),
            handle: Mutex::new(None),
        })
    }

    /// Tick period
    pub fn tick(&self) -> Duration {
        self.inner.tick
    }

    /// Run one scheduling pass as of `now` and return the launched job names
    ///
    /// Reloads the job source on the calling thread. Must be called from
    /// within a Tokio runtime.
    pub fn tick_once(&self, now: DateTime<Utc>) -> Vec<String> {
        let loaded = self.inner.source.load();
        self.inner.launch_due(loaded, now)
    }

    /// Names of jobs with a run in progress, sorted
    pub fn running_jobs(&self) -> Vec<String> {
        self.inner.running.names()
    }

    /// Handle to the set of running jobs
    pub fn running(&self) -> &RunningJobs {
        &self.inner.running
    }

    /// Last launch time of `job`, if it was launched since start
    pub fn last_run(&self, job: &str) -> Option<DateTime<Utc>> {
        self.inner.state.lock().last_run.get(job).copied()
    }

    /// Whether the tick loop is running
    pub fn is_running(&self) -> bool {
        self.handle.lock().as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Start the tick loop
    ///
    /// The first tick fires immediately. Starting an already running
    /// scheduler does nothing; a stopped scheduler cannot be restarted.
    pub fn start(&self) -> Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| VaultError::internal(format!("scheduler needs a Tokio runtime: {}", e)))?;

        if self.inner.shutdown.is_cancelled() {
            return Err(VaultError::internal("scheduler has been stopped"));
        }

        let mut handle = self.handle.lock();
        if handle.is_some() {
            debug!("Scheduler already running");
            return Ok(());
        }

        let inner = Arc::clone(&self.inner);
        info!("Scheduler started (tick {})", humantime::format_duration(inner.tick));
        *handle = Some(runtime.spawn(async move {
            let mut ticker = tokio::time::interval(inner.tick);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = inner.shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let loaded = inner.reload_blocking().await;
                        inner.launch_due(loaded, Utc::now());
                    }
                }
            }
            debug!("Scheduler loop exited");
        }));
        Ok(())
    }

    /// Stop the tick loop and wait for it to exit
    ///
    /// In-flight runs are not cancelled.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!("Scheduler loop ended abnormally: {}", e);
            }
        }
        info!("Scheduler stopped");
    }

    /// Wait until no run is in flight
    pub async fn wait_idle(&self) {
        while !self.inner.running.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}
