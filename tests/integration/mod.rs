//! End-to-end backup scenarios
//!
//! Drives the engine the way a front-end would: configure jobs, back up,
//! list, restore, prune and schedule, then compare the restored trees with
//! the originals byte for byte.

use ::dirvault::*;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tempfile::TempDir;
use tracing::info;
use walkdir::WalkDir;

/// Scratch source tree plus storage for one test
pub struct BackupHarness {
    pub source_dir: TempDir,
    pub storage_dir: TempDir,
}

impl BackupHarness {
    pub fn new() -> Self {
        Self {
            source_dir: TempDir::new().unwrap(),
            storage_dir: TempDir::new().unwrap(),
        }
    }

    /// Create `path` (relative to the source tree) with `content`
    pub fn write(&self, path: &str, content: &[u8]) -> PathBuf {
        let full = self.source_dir.path().join(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(&full, content).unwrap();
        full
    }

    /// A small project-like tree
    pub fn populate(&self) {
        self.write("data/users.csv", b"id,name\n1,ada\n2,grace\n");
        self.write("data/blobs/large.bin", &vec![0xAB; 64 * 1024]);
        self.write("data/empty.txt", b"");
        fs::create_dir_all(self.source_dir.path().join("data/empty-dir")).unwrap();
        self.write("config/app.toml", b"[server]\nport = 8080\n");
    }

    pub fn job(&self, name: &str, dirs: Vec<DirectoryEntry>) -> BackupJob {
        BackupJob {
            name: name.to_string(),
            directories: dirs,
            storage: StorageTarget::local(self.storage_dir.path().join(name)),
            ..Default::default()
        }
    }

    pub fn src(&self, relative: &str) -> PathBuf {
        self.source_dir.path().join(relative)
    }
}

impl Default for BackupHarness {
    fn default() -> Self {
        Self::new()
    }
}

/// Map of relative path -> content (None for directories)
pub fn snapshot(root: &Path) -> BTreeMap<String, Option<Vec<u8>>> {
    WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .map(|e| e.unwrap())
        .map(|e| {
            let key = e.path().strip_prefix(root).unwrap().to_string_lossy().replace('\\', "/");
            let content = e.file_type().is_file().then(|| fs::read(e.path()).unwrap());
            (key, content)
        })
        .collect()
}

/// Runner that counts calls before delegating
pub struct CountingRunner {
    pub inner: BackupOrchestrator,
    pub calls: AtomicUsize,
}

impl JobRunner for CountingRunner {
    fn run(&self, job: &BackupJob) -> Result<BackupRecord> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.run(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn test_nightly_round_trip() {
        let harness = BackupHarness::new();
        harness.populate();
        let job = harness.job("nightly", vec![DirectoryEntry::new(harness.src("data"), "data")]);
        let engine = BackupEngine::builder().jobs(vec![job]).build().unwrap();

        let before = snapshot(&harness.src("data"));
        let record = engine.run_job("nightly").unwrap();

        assert_eq!(record.directories.len(), 1);
        let dir = &record.directories[0];
        assert_eq!(dir.name, "data");
        assert_eq!(dir.file_count, 3);
        assert_eq!(dir.size, 22 + 64 * 1024);
        assert!(!record.compressed);
        assert!(record.verify_checksum());

        let target = TempDir::new().unwrap();
        engine.restore_record(&record.id, Some(target.path())).unwrap();
        assert_eq!(snapshot(&target.path().join("data")), before);
        info!("round trip of {} verified", record.id);
    }

    #[cfg(unix)]
    #[test]
    fn test_permissions_round_trip() {
        use std::os::unix::fs::PermissionsExt;

        let harness = BackupHarness::new();
        harness.populate();
        let script = harness.write("data/run.sh", b"#!/bin/sh\necho hi\n");
        fs::set_permissions(&script, fs::Permissions::from_mode(0o750)).unwrap();
        let secret = harness.write("data/secret.key", b"k");
        fs::set_permissions(&secret, fs::Permissions::from_mode(0o600)).unwrap();

        let job = harness.job("perms", vec![DirectoryEntry::new(harness.src("data"), "data").compressed(true)]);
        let engine = BackupEngine::builder().jobs(vec![job]).build().unwrap();
        let record = engine.run_job("perms").unwrap();

        let target = TempDir::new().unwrap();
        engine.restore_record(&record.id, Some(target.path())).unwrap();

        let mode = |p: PathBuf| fs::metadata(p).unwrap().permissions().mode() & 0o7777;
        assert_eq!(mode(target.path().join("data/run.sh")), 0o750);
        assert_eq!(mode(target.path().join("data/secret.key")), 0o600);
        assert_eq!(record.directories[0].permissions["run.sh"].mode, 0o750);
    }

    #[test]
    fn test_multiple_directories_mixed_compression() {
        let harness = BackupHarness::new();
        harness.populate();
        let job = harness.job(
            "mixed",
            vec![
                DirectoryEntry::new(harness.src("data"), "data").compressed(true),
                DirectoryEntry::new(harness.src("config"), "config"),
            ],
        );
        let storage = job.storage.local_path.clone();
        let engine = BackupEngine::builder().jobs(vec![job]).build().unwrap();

        let record = engine.run_job("mixed").unwrap();
        assert!(record.compressed);
        assert!(storage.join(&record.id).join("data.tar.gz").is_file());
        assert!(storage.join(&record.id).join("config.tar").is_file());

        // The gzip layer actually shrinks the repetitive blob
        let gz_size = fs::metadata(storage.join(&record.id).join("data.tar.gz")).unwrap().len();
        assert!(gz_size < record.directory("data").unwrap().size);

        let target = TempDir::new().unwrap();
        engine.restore_record(&record.id, Some(target.path())).unwrap();
        assert_eq!(snapshot(&target.path().join("config")), snapshot(&harness.src("config")));
        assert_eq!(snapshot(&target.path().join("data")), snapshot(&harness.src("data")));
    }

    #[test]
    fn test_missing_archive_fails_only_that_directory() {
        let harness = BackupHarness::new();
        harness.populate();
        let job = harness.job(
            "partial",
            vec![
                DirectoryEntry::new(harness.src("data"), "data"),
                DirectoryEntry::new(harness.src("config"), "config"),
            ],
        );
        let storage = job.storage.local_path.clone();
        let engine = BackupEngine::builder().jobs(vec![job]).build().unwrap();
        let record = engine.run_job("partial").unwrap();
        fs::remove_file(storage.join(&record.id).join("data.tar")).unwrap();

        let target = TempDir::new().unwrap();
        let err = engine.restore_record(&record.id, Some(target.path())).unwrap_err();
        assert!(matches!(err, VaultError::RestoreIncomplete { ref failed, .. } if failed == &vec!["data".to_string()]));
        assert!(target.path().join("config/app.toml").is_file());
    }

    #[test]
    fn test_corrupt_archive_detected_by_restore_and_verify() {
        let harness = BackupHarness::new();
        harness.populate();
        let job = harness.job("corrupt", vec![DirectoryEntry::new(harness.src("config"), "config")]);
        let storage = job.storage.local_path.clone();
        let engine = BackupEngine::builder()
            .jobs(vec![job])
            .verify_before_restore(false)
            .build()
            .unwrap();
        let record = engine.run_job("corrupt").unwrap();

        let archive = storage.join(&record.id).join("config.tar");
        fs::write(&archive, vec![0x5A; 1536]).unwrap();

        let target = TempDir::new().unwrap();
        assert!(matches!(
            engine.restore_record(&record.id, Some(target.path())),
            Err(VaultError::RestoreIncomplete { .. })
        ));
        assert!(!engine.verify_record(&record.id).unwrap().is_valid());
    }

    #[test]
    fn test_retention_across_runs() {
        let harness = BackupHarness::new();
        harness.populate();
        let mut job = harness.job("rotating", vec![DirectoryEntry::new(harness.src("config"), "config")]);
        job.retention = RetentionPolicy {
            keep_days: 30,
            keep_count: 3,
            keep_monthly: 0,
        };
        let engine = BackupEngine::builder().jobs(vec![job]).build().unwrap();

        let ids: Vec<String> = (0..5).map(|_| engine.run_job("rotating").unwrap().id).collect();
        let remaining: Vec<String> = engine
            .list_records("rotating")
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(remaining, vec![ids[4].clone(), ids[3].clone(), ids[2].clone()]);
    }

    #[test]
    fn test_jobs_sharing_storage_stay_separate() {
        let harness = BackupHarness::new();
        harness.populate();
        let shared = harness.storage_dir.path().join("shared");
        let mut a = harness.job("alpha", vec![DirectoryEntry::new(harness.src("data"), "data")]);
        let mut b = harness.job("alpha-beta", vec![DirectoryEntry::new(harness.src("config"), "config")]);
        a.storage = StorageTarget::local(&shared);
        b.storage = StorageTarget::local(&shared);
        a.retention.keep_count = 1;
        let engine = BackupEngine::builder().jobs(vec![a, b]).build().unwrap();

        engine.run_job("alpha-beta").unwrap();
        engine.run_job("alpha").unwrap();
        engine.run_job("alpha").unwrap();

        // Pruning alpha never touches alpha-beta, despite the shared prefix
        assert_eq!(engine.list_records("alpha").unwrap().len(), 1);
        assert_eq!(engine.list_records("alpha-beta").unwrap().len(), 1);
    }

    #[test]
    fn test_remote_mount_storage() {
        let harness = BackupHarness::new();
        harness.populate();
        let mount = TempDir::new().unwrap();
        let mut job = harness.job("offsite", vec![DirectoryEntry::new(harness.src("config"), "config")]);
        job.storage = StorageTarget::remote("s3://backups-bucket", mount.path());
        let engine = BackupEngine::builder().jobs(vec![job]).build().unwrap();

        let record = engine.run_job("offsite").unwrap();
        assert!(mount.path().join(&record.id).join("metadata.json").is_file());
        assert_eq!(engine.list_records("offsite").unwrap().len(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_json_config_with_command_hooks() {
        let harness = BackupHarness::new();
        harness.populate();
        let log = harness.storage_dir.path().join("hook.log");
        let config_path = harness.storage_dir.path().join("dirvault.json");

        let config = ConfigFile {
            jobs: vec![harness.job("hooked", vec![DirectoryEntry::new(harness.src("config"), "config")])],
            hooks: CommandHookConfig {
                quiesce: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("echo quiesce >> '{}'; echo web; echo db", log.display()),
                ],
                resume: vec![
                    "sh".to_string(),
                    "-c".to_string(),
                    format!("echo resume \"$@\" >> '{}'", log.display()),
                    "resume".to_string(),
                ],
            },
        };
        fs::write(&config_path, serde_json::to_vec_pretty(&config).unwrap()).unwrap();

        let file = JsonJobFile::new(&config_path);
        let hook = CommandServiceHook::new(file.read().unwrap().hooks);
        let engine = BackupEngine::builder()
            .job_source(Arc::new(file))
            .hook(Arc::new(hook))
            .build()
            .unwrap();

        engine.run_job("hooked").unwrap();
        let lines: Vec<String> = fs::read_to_string(&log).unwrap().lines().map(String::from).collect();
        assert_eq!(lines, vec!["quiesce", "resume web db"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_two_concurrent_jobs_through_scheduler() {
        let harness = BackupHarness::new();
        harness.populate();
        let jobs = vec![
            harness.job("first", vec![DirectoryEntry::new(harness.src("data"), "data")]),
            harness.job("second", vec![DirectoryEntry::new(harness.src("config"), "config")]),
        ];
        let source = Arc::new(StaticJobSource::new(jobs));
        let runner = Arc::new(CountingRunner {
            inner: BackupOrchestrator::default(),
            calls: AtomicUsize::new(0),
        });
        let scheduler = Scheduler::new(source, runner.clone(), Duration::from_secs(3600)).unwrap();

        let mut launched = scheduler.tick_once(chrono::Utc::now());
        launched.sort();
        assert_eq!(launched, vec!["first", "second"]);
        scheduler.wait_idle().await;
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);

        let first = MetadataStore::new(harness.storage_dir.path().join("first"));
        let second = MetadataStore::new(harness.storage_dir.path().join("second"));
        let first_records = first.list("first").unwrap();
        let second_records = second.list("second").unwrap();
        assert_eq!(first_records.len(), 1);
        assert_eq!(second_records.len(), 1);
        assert_eq!(first_records[0].directories[0].name, "data");
        assert_eq!(second_records[0].directories[0].name, "config");
        assert!(first.list("second").unwrap().is_empty());
    }
}
