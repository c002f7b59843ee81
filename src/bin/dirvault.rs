//! # dirvault CLI
//!
//! Command-line front-end for the dirvault backup engine.
//!
//! ## Usage
//! ```bash
//! # Back up one job, or every enabled job
//! dirvault --config /etc/dirvault.json run nightly
//! dirvault run --all
//!
//! # Inspect, verify and restore
//! dirvault list nightly --detailed
//! dirvault verify nightly-20240115-020000-000000
//! dirvault restore nightly-20240115-020000-000000 --target /tmp/restore
//!
//! # Apply retention, or keep running on schedule
//! dirvault cleanup nightly
//! dirvault daemon --tick 1m
//! ```

use clap::{Parser, Subcommand};
use colored::*;
use dirvault::config::JsonJobFile;
use dirvault::hooks::CommandServiceHook;
use dirvault::utils::format_bytes;
use dirvault::{BackupEngine, BackupRecord, Result, VaultError};
use humantime::format_duration;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// dirvault - checksummed directory backups
#[derive(Parser)]
#[command(name = "dirvault")]
#[command(version)]
#[command(about = "Archive, restore and prune directory backups")]
#[command(long_about = None)]
struct Cli {
    /// Job configuration file (JSON)
    #[arg(short, long, global = true, default_value = "dirvault.json")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Back up a job now
    Run {
        /// Job name
        job: Option<String>,

        /// Run every enabled job
        #[arg(long, conflicts_with = "job")]
        all: bool,
    },

    /// Show configured jobs
    Jobs,

    /// List backups of a job
    #[command(alias = "ls")]
    List {
        /// Job name
        job: String,

        /// Show per-directory details
        #[arg(short, long)]
        detailed: bool,

        /// Limit results
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Restore a backup
    Restore {
        /// Backup id
        id: String,

        /// Restore under this directory instead of the original paths
        #[arg(short, long)]
        target: Option<PathBuf>,
    },

    /// Apply the retention policy of a job now
    Cleanup {
        /// Job name
        job: String,
    },

    /// Check a backup's archives against its record
    Verify {
        /// Backup id
        id: String,
    },

    /// Run the scheduler until interrupted
    Daemon {
        /// Scheduler tick (e.g. "30s", "1m")
        #[arg(long, default_value = "1m")]
        tick: String,
    },
}

fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if std::env::var("NO_COLOR").is_ok() {
        colored::control::set_override(false);
    }

    if let Err(e) = run(cli) {
        eprintln!("{}: {}", "Error".red().bold(), e.user_message());
        std::process::exit(1);
    }
}

/// Main command runner
fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run { job, all } => cmd_run(&cli.config, job, all),
        Commands::Jobs => cmd_jobs(&cli.config),
        Commands::List { job, detailed, limit } => cmd_list(&cli.config, &job, detailed, limit),
        Commands::Restore { id, target } => cmd_restore(&cli.config, &id, target),
        Commands::Cleanup { job } => cmd_cleanup(&cli.config, &job),
        Commands::Verify { id } => cmd_verify(&cli.config, &id),
        Commands::Daemon { tick } => cmd_daemon(&cli.config, &tick),
    }
}

/// Build an engine over the configuration file, with its hook commands
fn open_engine(config: &Path, tick: Option<Duration>) -> Result<BackupEngine> {
    let file = JsonJobFile::new(config);
    let hooks = file.read()?.hooks;

    let mut builder = BackupEngine::builder()
        .job_source(Arc::new(file))
        .hook(Arc::new(CommandServiceHook::new(hooks)));
    if let Some(tick) = tick {
        builder = builder.tick(tick);
    }
    builder.build()
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.green} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

fn print_record(record: &BackupRecord) {
    println!("{} Created backup {}", "✓".green().bold(), record.id.yellow().bold());
    println!("  Directories: {}", record.directories.len().to_string().cyan());
    println!("  Files: {}", record.file_count().to_string().cyan());
    println!("  Size: {}", format_bytes(record.total_size).cyan());
    println!("  Checksum: {}", record.checksum.get(..16).unwrap_or(record.checksum.as_str()).dimmed());
}

/// Back up one job or all enabled jobs
fn cmd_run(config: &Path, job: Option<String>, all: bool) -> Result<()> {
    let engine = open_engine(config, None)?;
    let start = Instant::now();

    if all {
        let pb = spinner("Backing up all enabled jobs...");
        let (records, errors) = engine.run_all_enabled_jobs();
        pb.finish_and_clear();

        for record in &records {
            print_record(record);
        }
        for error in &errors {
            eprintln!("{} {}", "✗".red().bold(), error.user_message());
        }
        println!("  Time: {}", format_duration(truncate(start.elapsed())).to_string().cyan());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(VaultError::internal(format!(
                "{} of {} jobs failed",
                errors.len(),
                records.len() + errors.len()
            )))
        }
    } else {
        let Some(name) = job else {
            return Err(VaultError::config("specify a job name or --all"));
        };
        let pb = spinner(&format!("Backing up {}...", name));
        let result = engine.run_job(&name);
        pb.finish_and_clear();

        let record = result?;
        print_record(&record);
        println!("  Time: {}", format_duration(truncate(start.elapsed())).to_string().cyan());
        Ok(())
    }
}

/// Show configured jobs
fn cmd_jobs(config: &Path) -> Result<()> {
    let engine = open_engine(config, None)?;
    let jobs = engine.jobs()?;
    if jobs.is_empty() {
        println!("{}", "No jobs configured".yellow());
        return Ok(());
    }

    for job in jobs {
        let state = if !job.enabled {
            "disabled".red()
        } else if !job.schedule.enabled {
            "manual".yellow()
        } else {
            job.schedule.interval.as_str().green()
        };
        println!("{} [{}]", job.label().bold(), state);
        for dir in &job.directories {
            let compression = if dir.compress { " (gzip)" } else { "" };
            println!("  {} <- {}{}", dir.name.cyan(), dir.path.display(), compression);
        }
    }
    Ok(())
}

/// List backups of a job
fn cmd_list(config: &Path, job: &str, detailed: bool, limit: Option<usize>) -> Result<()> {
    let engine = open_engine(config, None)?;
    let records = engine.list_records(job)?;
    if records.is_empty() {
        println!("{}", format!("No backups of {}", job).yellow());
        return Ok(());
    }

    let shown = limit.unwrap_or(records.len());
    println!("{} ({} total)", format!("Backups of {}", job).blue().bold(), records.len());
    for record in records.iter().take(shown) {
        println!(
            "{}  {}  {}  {} files",
            record.id.yellow(),
            record.timestamp.format("%Y-%m-%d %H:%M:%S UTC"),
            format_bytes(record.total_size).cyan(),
            record.file_count()
        );
        if detailed {
            for dir in &record.directories {
                println!(
                    "    {} {} ({} files, {}{})",
                    "└─".dimmed(),
                    dir.name.bold(),
                    dir.file_count,
                    format_bytes(dir.size),
                    if dir.compressed { ", gzip" } else { "" }
                );
                println!("       {} {}", "checksum".dimmed(), dir.checksum.dimmed());
            }
        }
    }
    Ok(())
}

/// Restore a backup
fn cmd_restore(config: &Path, id: &str, target: Option<PathBuf>) -> Result<()> {
    let engine = open_engine(config, None)?;
    println!("{} {}", "Restoring".blue().bold(), id.yellow());

    let start = Instant::now();
    let pb = spinner("Extracting archives...");
    let result = engine.restore_record(id, target.as_deref());
    pb.finish_and_clear();
    let report = result?;

    for dir in &report.restored {
        println!(
            "{} {} -> {} ({} files, {})",
            "✓".green().bold(),
            dir.name.bold(),
            dir.target.display().to_string().cyan(),
            dir.files_restored,
            format_bytes(dir.bytes_written)
        );
    }
    let warnings = report.warnings();
    if !warnings.is_empty() {
        println!("{} {} warnings", "!".yellow().bold(), warnings.len());
        for warning in warnings.iter().take(10) {
            println!("  {}", warning.dimmed());
        }
    }
    println!("  Time: {}", format_duration(truncate(start.elapsed())).to_string().cyan());
    Ok(())
}

/// Apply retention
fn cmd_cleanup(config: &Path, job: &str) -> Result<()> {
    let engine = open_engine(config, None)?;
    let report = engine.cleanup(job)?;

    if report.deleted.is_empty() && report.failures.is_empty() {
        println!("{} Nothing to prune for {}", "✓".green().bold(), job);
    }
    for id in &report.deleted {
        println!("{} Deleted {}", "✓".green().bold(), id.yellow());
    }
    for (id, reason) in &report.failures {
        println!("{} Could not delete {}: {}", "✗".red().bold(), id.yellow(), reason);
    }
    Ok(())
}

/// Verify a backup
fn cmd_verify(config: &Path, id: &str) -> Result<()> {
    let engine = open_engine(config, None)?;
    let report = engine.verify_record(id)?;

    for dir in &report.directories {
        let mark = if dir.is_valid() { "✓".green().bold() } else { "✗".red().bold() };
        let detail = dir.error.clone().unwrap_or_else(|| format_bytes(dir.archive_size));
        println!("{} {} ({})", mark, dir.name, detail);
    }

    if report.is_valid() {
        println!("{}", report.summary().green());
        Ok(())
    } else {
        Err(VaultError::internal(report.summary()))
    }
}

/// Run the scheduler until SIGINT/SIGTERM
fn cmd_daemon(config: &Path, tick: &str) -> Result<()> {
    let tick = humantime::parse_duration(tick)
        .map_err(|e| VaultError::config(format!("invalid tick '{}': {}", tick, e)))?;
    let engine = open_engine(config, Some(tick))?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    runtime.block_on(async {
        let scheduler = engine.start_scheduler()?;
        println!(
            "{} Scheduler running (tick {}), press Ctrl-C to stop",
            "✓".green().bold(),
            format_duration(tick)
        );

        wait_for_shutdown().await;

        engine.stop_scheduler().await;
        let running = scheduler.running_jobs();
        if !running.is_empty() {
            info!("Waiting for {} running backups: {}", running.len(), running.join(", "));
            scheduler.wait_idle().await;
        }
        Ok::<(), VaultError>(())
    })
}

async fn wait_for_shutdown() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT, shutting down"),
        _ = terminate => info!("Received SIGTERM, shutting down"),
    }
}

fn truncate(duration: Duration) -> Duration {
    Duration::from_millis(duration.as_millis() as u64)
}
