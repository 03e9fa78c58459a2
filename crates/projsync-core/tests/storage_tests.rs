use chrono::Utc;
use std::path::PathBuf;
use tempfile::tempdir;

use projsync_core::hasher::ContentHash;
use projsync_core::index::IndexEntry;
use projsync_core::scanner::FileStamp;
use projsync_core::storage::{Database, FileRecord};
use projsync_core::sync::{BackupRun, RunStatus, RunTrigger};
use projsync_core::{Error, FailureKind};

fn stamp(size: u64) -> FileStamp {
    FileStamp {
        size,
        modified: 1_700_000_000_123_456_789,
    }
}

fn finished_run(copied: u64) -> BackupRun {
    let mut run = BackupRun::new(RunTrigger::Scheduled);
    run.start();
    for _ in 0..copied {
        run.record_copy(10);
    }
    run.record_failure(
        "locked.txt",
        &Error::SourceUnreadable {
            path: PathBuf::from("locked.txt"),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        },
    );
    run.complete();
    run
}

#[test]
fn test_file_records_upsert_and_scope_isolation() {
    let db = Database::open_in_memory().unwrap();
    let hash = ContentHash::of_bytes(b"abc");
    db.upsert_file_record("sync:/b", &FileRecord::new("a.txt", stamp(3), Some(hash)))
        .unwrap();
    let mut updated = FileRecord::new("a.txt", stamp(4), None);
    updated.indexed = true;
    db.upsert_file_record("sync:/b", &updated).unwrap();
    db.upsert_file_record("index", &FileRecord::new("a.txt", stamp(3), Some(hash)))
        .unwrap();

    let records = db.load_file_records("sync:/b").unwrap();
    assert_eq!(records, vec![updated]);
    assert_eq!(records[0].modified, 1_700_000_000_123_456_789);

    assert!(db.delete_file_record("sync:/b", "a.txt").unwrap());
    assert!(!db.delete_file_record("sync:/b", "a.txt").unwrap());
    assert_eq!(db.load_file_records("index").unwrap().len(), 1);
}

#[test]
fn test_index_entries_keep_one_text_row_per_path() {
    let db = Database::open_in_memory().unwrap();
    let entry = IndexEntry {
        path: "/p/readme.md".into(),
        content_hash: ContentHash::of_bytes(b"# readme"),
        size: 8,
        preview: "# readme".into(),
        last_indexed: Utc::now(),
    };
    db.upsert_index_entry(&entry, "# readme draft").unwrap();
    db.upsert_index_entry(&entry, "# readme final").unwrap();

    let stored = db.load_index_entries().unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].path, entry.path);
    assert_eq!(stored[0].content_hash, entry.content_hash);

    let text_rows: i64 = db
        .connection()
        .query_row("SELECT COUNT(*) FROM index_fts", [], |row| row.get(0))
        .unwrap();
    assert_eq!(text_rows, 1);
    assert!(db.search_index_text("\"draft\"").unwrap().is_empty());
    assert_eq!(
        db.search_index_text("\"readme\" AND \"final\"").unwrap(),
        vec![("/p/readme.md".to_string(), "# readme final".to_string())]
    );

    let removed = db
        .delete_index_entries(&["/p/readme.md".to_string(), "/p/other".to_string()])
        .unwrap();
    assert_eq!(removed, 1);
    assert!(db.search_index_text("\"readme\"").unwrap().is_empty());
}

#[test]
fn test_backup_runs_keep_failures_and_evict_oldest() {
    let db = Database::open_in_memory().unwrap();
    let mut ids = Vec::new();
    for copied in 0..4 {
        ids.push(db.insert_backup_run(&finished_run(copied)).unwrap());
    }
    assert_eq!(db.prune_backup_runs(2).unwrap(), 2);

    let runs = db.list_backup_runs(10).unwrap();
    assert_eq!(runs.len(), 2);
    assert_eq!(runs[0].id(), Some(ids[3]));
    assert_eq!(runs[1].id(), Some(ids[2]));
    assert_eq!(runs[0].status(), RunStatus::Completed);
    assert_eq!(runs[0].trigger(), RunTrigger::Scheduled);
    assert_eq!(runs[0].files_copied(), 3);
    assert_eq!(runs[0].bytes_copied(), 30);
    assert_eq!(runs[0].failures()[0].kind, FailureKind::SourceUnreadable);
    assert!(runs[0].finished_at().is_some());
}

#[test]
fn test_reopen_keeps_state_and_schema_version() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("state.db");
    {
        let db = Database::open(&path).unwrap();
        db.insert_backup_run(&finished_run(1)).unwrap();
    }
    let db = Database::open(&path).unwrap();
    assert_eq!(db.list_backup_runs(10).unwrap().len(), 1);
    let version: i64 = db
        .connection()
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap();
    assert_eq!(version, 2);
    let mode: String = db
        .connection()
        .query_row("PRAGMA journal_mode", [], |row| row.get(0))
        .unwrap();
    assert_eq!(mode, "wal");
}
