use crossbeam_channel::Receiver;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::cancel::CancellationToken;
use crate::config::{roots_overlap, AppConfig, SyncConfig};
use crate::error::Error;
use crate::events::{EngineEvent, EventBus};
use crate::hasher::ContentHasher;
use crate::index::{
    absolute_root, ContentIndex, DuplicateGroup, IndexEntry, IndexStats, IndexUpdater, ReconcileSummary, SearchHit,
};
use crate::progress::{ProgressReporter, SilentReporter};
use crate::scheduler::{BackupScheduler, SchedulerHandle};
use crate::storage::{Database, SharedDatabase};
use crate::sync::{BackupRun, RunTrigger, SyncEngine, SyncPlan};

pub const DEFAULT_SEARCH_LIMIT: usize = 50;

/// Everything wired from one `AppConfig`: the backup scheduler over the
/// configured sync pair, the content index and the event bus.
pub struct Engine {
    config: AppConfig,
    db: SharedDatabase,
    events: Arc<EventBus>,
    scheduler: BackupScheduler,
    index: Arc<ContentIndex>,
    updater: IndexUpdater,
    reporter: Arc<dyn ProgressReporter>,
    timer: Mutex<Option<SchedulerHandle>>,
}

impl Engine {
    /// Validate `config` and open the database it names.
    pub fn open(config: AppConfig) -> Result<Self, Error> {
        Self::open_with_reporter(config, Arc::new(SilentReporter))
    }

    pub fn open_with_reporter(
        config: AppConfig,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let db = Database::open(&config.storage.database_path)?.into_shared();
        info!("Opened database {}", config.storage.database_path.display());
        Self::open_with(config, db, reporter)
    }

    pub fn open_with(
        config: AppConfig,
        db: SharedDatabase,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let hasher = Arc::new(ContentHasher::new());
        let events = Arc::new(EventBus::default());

        let sync = SyncEngine::open(config.sync.clone(), db.clone(), hasher.clone())?;
        let scheduler = BackupScheduler::new(sync, events.clone(), config.storage.run_history_limit)
            .with_database(db.clone())
            .with_reporter(reporter.clone());

        let index = Arc::new(ContentIndex::open(db.clone())?);
        let updater = IndexUpdater::open(&config.index, index.clone(), db.clone(), hasher)?;

        Ok(Self {
            config,
            db,
            events,
            scheduler,
            index,
            updater,
            reporter,
            timer: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn database(&self) -> &SharedDatabase {
        &self.db
    }

    pub fn subscribe(&self) -> Result<Receiver<EngineEvent>, Error> {
        self.events.subscribe()
    }

    // Trigger surface

    pub fn start_manual_backup(&self) -> Result<(), Error> {
        self.scheduler.start_manual_backup()
    }

    /// Block until the active backup (if any) finishes.
    pub fn wait_for_backup(&self) -> Option<BackupRun> {
        self.scheduler.wait()
    }

    pub fn is_run_active(&self) -> bool {
        self.scheduler.is_run_active()
    }

    pub fn last_run_result(&self) -> Option<BackupRun> {
        self.scheduler.last_run_result()
    }

    pub fn run_history(&self) -> Result<Vec<BackupRun>, Error> {
        self.scheduler.history(self.config.storage.run_history_limit)
    }

    pub fn cancel_backup(&self) -> bool {
        self.scheduler.cancel_active_run()
    }

    pub fn plan_backup(&self) -> Result<SyncPlan, Error> {
        self.scheduler.engine().plan_configured()
    }

    /// Start periodic backups at the configured interval.
    pub fn start_scheduler(&self) -> Result<(), Error> {
        let interval = self.config.sync.schedule_interval().ok_or_else(|| {
            Error::InvalidConfig("sync.schedule_interval_seconds is not set".into())
        })?;
        let mut timer = self
            .timer
            .lock()
            .map_err(|e| Error::Other(format!("Failed to lock scheduler: {}", e)))?;
        if timer.is_some() {
            debug!("Scheduler already running");
            return Ok(());
        }
        *timer = Some(self.scheduler.spawn(interval)?);
        Ok(())
    }

    /// Stop the timer, cancel any active pass and wait for it.
    pub fn shutdown(&self) {
        let handle = match self.timer.lock() {
            Ok(mut timer) => timer.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        match handle {
            Some(handle) => handle.shutdown(),
            None => {
                self.scheduler.cancel_active_run();
                self.scheduler.wait();
            }
        }
    }

    /// Copy a backup tree back into `target_root`. Existing newer files are
    /// kept unless `overwrite` is set; nothing is deleted.
    pub fn restore(
        &self,
        backup_root: &Path,
        target_root: &Path,
        overwrite: bool,
    ) -> Result<BackupRun, Error> {
        if roots_overlap(backup_root, target_root) {
            return Err(Error::InvalidConfig(format!(
                "restore source '{}' and target '{}' overlap",
                backup_root.display(),
                target_root.display()
            )));
        }
        let config = SyncConfig {
            exclude_patterns: Vec::new(),
            verify_after_copy: self.config.sync.verify_after_copy,
            delete_orphans: false,
            preserve_newer: !overwrite,
            checkpoint_stores: false,
            ..SyncConfig::new(backup_root, target_root)
        };
        let engine = SyncEngine::in_memory(config)?;
        info!(
            "Restoring {} into {} (overwrite: {})",
            backup_root.display(),
            target_root.display(),
            overwrite
        );
        Ok(engine.run_pass(
            RunTrigger::Manual,
            &CancellationToken::new(),
            self.reporter.as_ref(),
        ))
    }

    // Index surface

    pub fn index_project(&self, root: &Path) -> Result<ReconcileSummary, Error> {
        let summary = self.updater.reconcile_with(root, self.reporter.as_ref())?;
        self.events.publish(EngineEvent::IndexUpdated {
            root: root.display().to_string(),
            summary: summary.clone(),
        });
        Ok(summary)
    }

    pub fn search(&self, query: &str) -> Result<Vec<IndexEntry>, Error> {
        Ok(self
            .search_hits(query, DEFAULT_SEARCH_LIMIT, None)?
            .into_iter()
            .map(|hit| hit.entry)
            .collect())
    }

    /// Ranked hits, restricted to entries under `root` when given.
    pub fn search_hits(
        &self,
        query: &str,
        limit: usize,
        root: Option<&Path>,
    ) -> Result<Vec<SearchHit>, Error> {
        let root = root.map(absolute_root).transpose()?;
        self.index.search_in(query, limit, root.as_deref())
    }

    pub fn find_duplicates(&self) -> Vec<DuplicateGroup> {
        self.index.duplicates()
    }

    pub fn find_duplicates_in(&self, root: &Path) -> Result<Vec<DuplicateGroup>, Error> {
        Ok(self.index.duplicates_in(Some(&absolute_root(root)?)))
    }

    pub fn index_entry(&self, path: &str) -> Option<IndexEntry> {
        self.index.get(path)
    }

    pub fn remove_path(&self, path: &Path) -> Result<bool, Error> {
        self.updater.remove_path(path)
    }

    pub fn index_statistics(&self) -> IndexStats {
        self.index.statistics()
    }

    pub fn index_statistics_in(&self, root: &Path) -> Result<IndexStats, Error> {
        Ok(self.index.statistics_in(Some(&absolute_root(root)?)))
    }

    pub fn clear_index(&self) -> Result<usize, Error> {
        let removed = self.updater.clear(None)?;
        self.events.publish(EngineEvent::IndexCleared { removed });
        Ok(removed)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}
