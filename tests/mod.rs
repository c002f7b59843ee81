//! Main test module for dirvault
//!
//! This module includes all test suites:
//! - Integration tests for end-to-end backup scenarios
//! - Property-based tests for round-trip and retention invariants
//! - Edge cases below

pub mod integration;
pub mod property;

#[cfg(test)]
mod edge_cases {
    use ::dirvault::*;
    use std::fs;
    use tempfile::TempDir;
    use tokio_util::sync::CancellationToken;

    fn engine_for(source: &std::path::Path, storage: &std::path::Path, compress: bool) -> BackupEngine {
        BackupEngine::builder()
            .jobs(vec![BackupJob {
                name: "edge".to_string(),
                directories: vec![DirectoryEntry::new(source, "tree").compressed(compress)],
                storage: StorageTarget::local(storage),
                ..Default::default()
            }])
            .build()
            .unwrap()
    }

    #[test]
    fn test_empty_directory() {
        let source = TempDir::new().unwrap();
        let storage = TempDir::new().unwrap();
        let engine = engine_for(source.path(), storage.path(), false);

        let record = engine.run_job("edge").unwrap();
        assert_eq!(record.directories[0].file_count, 0);
        assert_eq!(record.total_size, 0);

        let target = TempDir::new().unwrap();
        let report = engine.restore_record(&record.id, Some(target.path())).unwrap();
        assert_eq!(report.files_restored(), 0);
        assert!(target.path().join("tree").is_dir());
    }

    #[test]
    fn test_special_filenames() {
        let source = TempDir::new().unwrap();
        let storage = TempDir::new().unwrap();

        let special_names = vec![
            "file with spaces.txt",
            "file-with-dashes.txt",
            "file_with_underscores.txt",
            "file.multiple.dots.txt",
            "UPPERCASE.TXT",
            "ünïcödé.txt",
            "emoji_🎉.txt",
        ];
        for name in &special_names {
            fs::write(source.path().join(name), format!("content of {}", name)).unwrap();
        }

        let engine = engine_for(source.path(), storage.path(), true);
        let record = engine.run_job("edge").unwrap();
        assert_eq!(record.directories[0].file_count, special_names.len());

        let target = TempDir::new().unwrap();
        engine.restore_record(&record.id, Some(target.path())).unwrap();
        for name in &special_names {
            assert_eq!(
                fs::read_to_string(target.path().join("tree").join(name)).unwrap(),
                format!("content of {}", name)
            );
        }
    }

    #[test]
    fn test_long_paths() {
        let source = TempDir::new().unwrap();
        let storage = TempDir::new().unwrap();

        // Beyond the 100-byte ustar name field
        let mut deep = source.path().to_path_buf();
        for i in 0..12 {
            deep = deep.join(format!("nested_directory_level_{:02}", i));
        }
        fs::create_dir_all(&deep).unwrap();
        fs::write(deep.join("leaf.txt"), b"deep down").unwrap();

        let engine = engine_for(source.path(), storage.path(), false);
        let record = engine.run_job("edge").unwrap();

        let target = TempDir::new().unwrap();
        engine.restore_record(&record.id, Some(target.path())).unwrap();
        let relative = deep.strip_prefix(source.path()).unwrap();
        assert_eq!(
            fs::read(target.path().join("tree").join(relative).join("leaf.txt")).unwrap(),
            b"deep down"
        );
    }

    #[test]
    fn test_restore_overwrites_existing_files() {
        let source = TempDir::new().unwrap();
        let storage = TempDir::new().unwrap();
        fs::write(source.path().join("config.ini"), b"original=1").unwrap();

        let engine = engine_for(source.path(), storage.path(), false);
        let record = engine.run_job("edge").unwrap();

        fs::write(source.path().join("config.ini"), b"changed=2, and longer").unwrap();
        // No override: back to the original location
        engine.restore_record(&record.id, None).unwrap();
        assert_eq!(fs::read(source.path().join("config.ini")).unwrap(), b"original=1");
    }

    #[test]
    fn test_backup_ids_unique_for_rapid_runs() {
        let source = TempDir::new().unwrap();
        let storage = TempDir::new().unwrap();
        fs::write(source.path().join("a"), b"a").unwrap();
        let engine = engine_for(source.path(), storage.path(), false);

        let mut ids: Vec<String> = (0..10).map(|_| engine.run_job("edge").unwrap().id).collect();
        ids.sort();
        ids.dedup();
        assert_eq!(ids.len(), 10);
    }

    #[test]
    fn test_record_file_is_plain_json() {
        let source = TempDir::new().unwrap();
        let storage = TempDir::new().unwrap();
        fs::write(source.path().join("a.txt"), b"abc").unwrap();
        let engine = engine_for(source.path(), storage.path(), false);
        let record = engine.run_job("edge").unwrap();

        let raw = fs::read_to_string(storage.path().join(&record.id).join("metadata.json")).unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["id"], record.id);
        assert_eq!(value["compressed"], false);
        assert_eq!(value["directories"][0]["name"], "tree");
        assert_eq!(value["directories"][0]["file_count"], 1);
        let mode = value["directories"][0]["permissions"]["a.txt"]["mode"].as_str().unwrap();
        assert_eq!(mode.len(), 4);
        assert!(value["timestamp"].as_str().unwrap().contains('T'));
    }

    #[test]
    fn test_symbolic_mode_metadata_accepted() {
        let source = TempDir::new().unwrap();
        let storage = TempDir::new().unwrap();
        fs::write(source.path().join("a.txt"), b"abc").unwrap();
        let engine = engine_for(source.path(), storage.path(), false);
        let record = engine.run_job("edge").unwrap();

        // Rewrite the mode in symbolic form, as another tool might
        let path = storage.path().join(&record.id).join("metadata.json");
        let mut value: serde_json::Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        value["directories"][0]["permissions"]["a.txt"]["mode"] = serde_json::json!("-rw-r-----");
        fs::write(&path, serde_json::to_vec(&value).unwrap()).unwrap();

        let reloaded = MetadataStore::new(storage.path()).load(&record.id).unwrap();
        assert_eq!(reloaded.directories[0].permissions["a.txt"].mode, 0o640);
    }

    #[test]
    fn test_cancelled_run_leaves_no_partial_backup() {
        let source = TempDir::new().unwrap();
        let storage = TempDir::new().unwrap();
        fs::write(source.path().join("a.txt"), b"abc").unwrap();
        let job = BackupJob {
            name: "edge".to_string(),
            directories: vec![DirectoryEntry::new(source.path(), "tree")],
            storage: StorageTarget::local(storage.path()),
            ..Default::default()
        };

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = BackupOrchestrator::default().run_with(&job, &cancel).unwrap_err();
        assert_eq!(err.failed_stage(), Some(RunStage::Archive));
        assert_eq!(fs::read_dir(storage.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_engine_usable_after_cancel() {
        let source = TempDir::new().unwrap();
        let storage = TempDir::new().unwrap();
        fs::write(source.path().join("a.txt"), b"abc").unwrap();
        let engine = engine_for(source.path(), storage.path(), false);

        engine.cancel();
        engine.cancel();
        let record = engine.run_job("edge").unwrap();
        assert_eq!(engine.list_records("edge").unwrap(), vec![record]);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_utf8_file_names_survive_engine_round_trip() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let source = TempDir::new().unwrap();
        let storage = TempDir::new().unwrap();
        let latin1 = OsStr::from_bytes(b"r\xe9sum\xe9.txt");
        let similar = OsStr::from_bytes(b"r\xe8sum\xe8.txt");
        fs::write(source.path().join(latin1), b"latin-1").unwrap();
        fs::write(source.path().join(similar), b"other").unwrap();
        let engine = engine_for(source.path(), storage.path(), true);

        let record = engine.run_job("edge").unwrap();
        assert_eq!(record.directories[0].file_count, 2);

        let target = TempDir::new().unwrap();
        let report = engine.restore_record(&record.id, Some(target.path())).unwrap();
        assert_eq!(report.files_restored(), 2);
        assert_eq!(fs::read(target.path().join("tree").join(latin1)).unwrap(), b"latin-1");
        assert_eq!(fs::read(target.path().join("tree").join(similar)).unwrap(), b"other");
        assert!(engine.verify_record(&record.id).unwrap().is_valid());
    }

    #[test]
    fn test_archive_file_never_visible_while_cancelled() {
        let source = TempDir::new().unwrap();
        let out = TempDir::new().unwrap();
        fs::write(source.path().join("a.txt"), b"abc").unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = Archiver::new().archive(&DirectoryEntry::new(source.path(), "tree"), out.path(), &cancel);
        assert!(matches!(result, Err(VaultError::Cancelled)));
        assert!(!out.path().join("tree.tar").exists());
    }
}
