use crossbeam_channel::{bounded, Receiver, Sender};
use std::fs;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::{tempdir, TempDir};

use projsync_core::config::{AppConfig, SyncConfig};
use projsync_core::events::EventBus;
use projsync_core::scheduler::BackupScheduler;
use projsync_core::storage::Database;
use projsync_core::sync::{RunStatus, RunTrigger, SyncEngine};
use projsync_core::{Engine, EngineEvent, Error, ProgressReporter, SilentReporter};

struct Fixture {
    src: TempDir,
    dst: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let src = tempdir().unwrap();
        let dst = tempdir().unwrap();
        fs::write(src.path().join("a.txt"), "hello").unwrap();
        fs::write(src.path().join("b.txt"), "hello").unwrap();
        fs::write(src.path().join("c.md"), "notes about backups").unwrap();
        Self { src, dst }
    }

    fn config(&self) -> AppConfig {
        let mut sync = SyncConfig::new(self.src.path(), self.dst.path().join("backup"));
        sync.exclude_patterns = vec!["*.tmp".to_string()];
        AppConfig {
            sync,
            ..AppConfig::default()
        }
    }

    fn engine(&self, config: AppConfig) -> Engine {
        let db = Database::open_in_memory().unwrap().into_shared();
        Engine::open_with(config, db, Arc::new(SilentReporter)).unwrap()
    }
}

/// Holds a pass at the planning stage until released.
struct Gate {
    release: Mutex<Receiver<()>>,
}

impl Gate {
    fn new() -> (Arc<Self>, Sender<()>) {
        let (tx, rx) = bounded(1);
        (
            Arc::new(Self {
                release: Mutex::new(rx),
            }),
            tx,
        )
    }
}

impl ProgressReporter for Gate {
    fn on_plan_start(&self, _root: &str) {
        let _ = self
            .release
            .lock()
            .unwrap()
            .recv_timeout(Duration::from_secs(10));
    }
}

#[test]
fn test_manual_backup_and_history() {
    let fixture = Fixture::new();
    let engine = fixture.engine(fixture.config());

    engine.start_manual_backup().unwrap();
    let run = engine.wait_for_backup().unwrap();
    assert!(run.is_clean(), "{}", run);
    assert_eq!(run.files_copied(), 3);
    assert!(!engine.is_run_active());
    assert_eq!(engine.last_run_result().unwrap().files_copied(), 3);

    let history = engine.run_history().unwrap();
    assert_eq!(history.len(), 1);
    assert!(history[0].id().is_some());
    assert_eq!(history[0].trigger(), RunTrigger::Manual);
}

#[test]
fn test_history_is_bounded_oldest_evicted() {
    let fixture = Fixture::new();
    let mut config = fixture.config();
    config.storage.run_history_limit = 3;
    let engine = fixture.engine(config);

    let mut ids = Vec::new();
    for _ in 0..5 {
        engine.start_manual_backup().unwrap();
        ids.push(engine.wait_for_backup().unwrap().id().unwrap());
    }
    let kept: Vec<i64> = engine
        .run_history()
        .unwrap()
        .iter()
        .map(|r| r.id().unwrap())
        .collect();
    assert_eq!(kept, vec![ids[4], ids[3], ids[2]]);
}

#[test]
fn test_manual_trigger_rejected_and_tick_skipped_while_active() {
    let fixture = Fixture::new();
    let config = fixture.config();
    let (gate, release) = Gate::new();
    let engine = SyncEngine::in_memory(config.sync.clone()).unwrap();
    let events = Arc::new(EventBus::default());
    let rx = events.subscribe().unwrap();
    let scheduler = BackupScheduler::new(engine, events, 10).with_reporter(gate);

    scheduler.start_manual_backup().unwrap();
    assert!(scheduler.is_run_active());
    assert!(matches!(scheduler.start_manual_backup(), Err(Error::Busy)));
    assert!(!scheduler.tick());

    release.send(()).unwrap();
    let run = scheduler.wait().unwrap();
    assert_eq!(run.status(), RunStatus::Completed);
    assert_eq!(scheduler.history(10).unwrap().len(), 1);

    let events: Vec<EngineEvent> = rx.try_iter().collect();
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::BackupSkipped { .. })));
    assert!(events
        .iter()
        .any(|e| matches!(e, EngineEvent::BackupCompleted { .. })));

    // Idle again: a tick starts a pass.
    assert!(scheduler.tick());
    assert_eq!(scheduler.wait().unwrap().trigger(), RunTrigger::Scheduled);
}

#[test]
fn test_cancel_backup_fails_the_run() {
    let fixture = Fixture::new();
    let (gate, release) = Gate::new();
    let db = Database::open_in_memory().unwrap().into_shared();
    let engine = Engine::open_with(fixture.config(), db, gate).unwrap();

    engine.start_manual_backup().unwrap();
    assert!(engine.cancel_backup());
    release.send(()).unwrap();
    let run = engine.wait_for_backup().unwrap();
    assert_eq!(run.status(), RunStatus::Failed);
    assert_eq!(run.files_copied(), 0);
    assert!(!engine.cancel_backup());
}

#[test]
fn test_scheduler_runs_and_shuts_down() {
    let fixture = Fixture::new();
    let mut config = fixture.config();
    config.sync.schedule_interval_seconds = Some(1);
    let engine = fixture.engine(config);
    let rx = engine.subscribe().unwrap();

    engine.start_scheduler().unwrap();
    let completed = loop {
        match rx.recv_timeout(Duration::from_secs(10)) {
            Ok(EngineEvent::BackupCompleted { run }) => break run,
            Ok(_) => continue,
            Err(err) => panic!("no scheduled run: {}", err),
        }
    };
    assert_eq!(completed.trigger(), RunTrigger::Scheduled);
    engine.shutdown();
    assert!(!engine.is_run_active());
}

#[test]
fn test_start_scheduler_requires_interval() {
    let fixture = Fixture::new();
    let engine = fixture.engine(fixture.config());
    assert!(matches!(
        engine.start_scheduler(),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn test_index_surface() {
    let fixture = Fixture::new();
    let engine = fixture.engine(fixture.config());
    let src = fixture.src.path();

    let summary = engine.index_project(src).unwrap();
    assert_eq!(summary.inserted, 3);

    let found = engine.search("backups").unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].path, src.join("c.md").to_string_lossy());
    assert_eq!(found[0].preview, "notes about backups");

    let groups = engine.find_duplicates();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].paths.len(), 2);
    let size = engine.index_entry(&groups[0].paths[0]).unwrap().size;
    assert_eq!(groups[0].wasted_bytes(size), 5);

    let stats = engine.index_statistics();
    assert_eq!(stats.file_count, 3);
    assert_eq!(stats.by_extension.get("txt"), Some(&2));

    assert!(engine.remove_path(&src.join("b.txt")).unwrap());
    assert!(engine.find_duplicates().is_empty());

    assert_eq!(engine.clear_index().unwrap(), 2);
    assert_eq!(engine.index_statistics().file_count, 0);
}

#[test]
fn test_restore_respects_newer_files_unless_overwriting() {
    let fixture = Fixture::new();
    let engine = fixture.engine(fixture.config());
    engine.start_manual_backup().unwrap();
    assert!(engine.wait_for_backup().unwrap().is_clean());

    let target = tempdir().unwrap();
    fs::write(target.path().join("a.txt"), "local edit that is newer").unwrap();
    let backup_root = fixture.dst.path().join("backup");

    let run = engine.restore(&backup_root, target.path(), false).unwrap();
    assert!(run.is_clean());
    assert_eq!(
        fs::read_to_string(target.path().join("a.txt")).unwrap(),
        "local edit that is newer"
    );
    assert_eq!(
        fs::read_to_string(target.path().join("c.md")).unwrap(),
        "notes about backups"
    );

    engine.restore(&backup_root, target.path(), true).unwrap();
    assert_eq!(
        fs::read_to_string(target.path().join("a.txt")).unwrap(),
        "hello"
    );
}

#[test]
fn test_open_rejects_overlapping_roots() {
    let fixture = Fixture::new();
    let mut config = fixture.config();
    config.sync.destination_root = fixture.src.path().join("backup");
    let db = Database::open_in_memory().unwrap().into_shared();
    assert!(matches!(
        Engine::open_with(config, db, Arc::new(SilentReporter)),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn test_history_persists_across_engines() {
    let fixture = Fixture::new();
    let db_dir = tempdir().unwrap();
    let mut config = fixture.config();
    config.storage.database_path = db_dir.path().join("projsync.db");

    {
        let engine = Engine::open(config.clone()).unwrap();
        engine.start_manual_backup().unwrap();
        engine.wait_for_backup();
    }
    let engine = Engine::open(config).unwrap();
    assert_eq!(engine.run_history().unwrap().len(), 1);
    // Records persisted with the history: the second pass copies nothing.
    engine.start_manual_backup().unwrap();
    assert_eq!(engine.wait_for_backup().unwrap().files_copied(), 0);
}

#[test]
fn test_index_queries_scoped_by_root() {
    let fixture = Fixture::new();
    let engine = fixture.engine(fixture.config());
    let other = tempdir().unwrap();
    fs::write(other.path().join("a.txt"), "hello").unwrap();
    fs::write(other.path().join("more.md"), "backups elsewhere").unwrap();
    engine.index_project(fixture.src.path()).unwrap();
    engine.index_project(other.path()).unwrap();

    // Unscoped, the three "hello" files form one group.
    assert_eq!(engine.find_duplicates()[0].paths.len(), 3);
    assert_eq!(engine.search("backups").unwrap().len(), 2);

    let hits = engine.search_hits("backups", 10, Some(other.path())).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].entry.path, other.path().join("more.md").to_string_lossy());

    let groups = engine.find_duplicates_in(fixture.src.path()).unwrap();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].paths.len(), 2);
    assert!(engine.find_duplicates_in(other.path()).unwrap().is_empty());

    let stats = engine.index_statistics_in(other.path()).unwrap();
    assert_eq!(stats.file_count, 2);
    assert_eq!(stats.duplicate_groups, 0);
    assert_eq!(engine.index_statistics().file_count, 5);
}
