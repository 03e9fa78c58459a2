mod execute;
mod plan;
mod run;

pub use execute::{copy_atomic, CopiedFile, CopyVerifier, RehashVerifier, PARTIAL_SUFFIX};
pub use plan::{safe_join, FileAction, PlanOptions, SkipReason, SyncPlan};
pub use run::{BackupRun, FileFailure, RunStatus, RunTrigger};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info};

use crate::cancel::CancellationToken;
use crate::checkpoint::{Checkpointer, SqliteCheckpointer};
use crate::config::SyncConfig;
use crate::error::Error;
use crate::hasher::{ContentHasher, RecordCache};
use crate::matcher::PathMatcher;
use crate::progress::ProgressReporter;
use crate::storage::SharedDatabase;
use plan::Planner;

/// Record scope for the sync pair writing into `destination_root`.
pub fn record_scope(destination_root: &Path) -> String {
    format!("sync:{}", destination_root.display())
}

/// Plans and executes synchronization passes for one configured
/// source/destination pair.
///
/// Ad-hoc pairs planned with [`SyncEngine::plan`] get their own record
/// scope, loaded on first use and kept for the engine's lifetime.
pub struct SyncEngine {
    config: SyncConfig,
    matcher: PathMatcher,
    hasher: Arc<ContentHasher>,
    records: Arc<RecordCache>,
    other_scopes: DashMap<String, Arc<RecordCache>>,
    db: Option<SharedDatabase>,
    checkpointer: Arc<dyn Checkpointer>,
    verifier: Arc<dyn CopyVerifier>,
}

impl SyncEngine {
    pub fn new(
        config: SyncConfig,
        records: RecordCache,
        hasher: Arc<ContentHasher>,
    ) -> Result<Self, Error> {
        let matcher = PathMatcher::new(&config.exclude_patterns)?;
        let checkpointer = SqliteCheckpointer::with_busy_timeout(config.checkpoint_timeout());
        Ok(Self {
            config,
            matcher,
            hasher,
            records: Arc::new(records),
            other_scopes: DashMap::new(),
            db: None,
            checkpointer: Arc::new(checkpointer),
            verifier: Arc::new(RehashVerifier),
        })
    }

    /// Engine whose records live only as long as it does.
    pub fn in_memory(config: SyncConfig) -> Result<Self, Error> {
        let records = RecordCache::in_memory(record_scope(&config.destination_root));
        Self::new(config, records, Arc::new(ContentHasher::new()))
    }

    /// Engine whose records persist in `db` under this pair's scope.
    pub fn open(
        config: SyncConfig,
        db: SharedDatabase,
        hasher: Arc<ContentHasher>,
    ) -> Result<Self, Error> {
        let records = RecordCache::load(record_scope(&config.destination_root), db.clone())?;
        let mut engine = Self::new(config, records, hasher)?;
        engine.db = Some(db);
        Ok(engine)
    }

    pub fn with_checkpointer(mut self, checkpointer: Arc<dyn Checkpointer>) -> Self {
        self.checkpointer = checkpointer;
        self
    }

    /// Replace how copies are checked before they are renamed into place.
    pub fn with_verifier(mut self, verifier: Arc<dyn CopyVerifier>) -> Self {
        self.verifier = verifier;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn hasher(&self) -> &ContentHasher {
        &self.hasher
    }

    /// Records of the configured pair.
    pub fn records(&self) -> &RecordCache {
        &self.records
    }

    /// Records for `scope`, in the same store as the configured pair's.
    pub fn records_for(&self, scope: &str) -> Result<Arc<RecordCache>, Error> {
        if scope == self.records.scope() {
            return Ok(self.records.clone());
        }
        let records = match self.other_scopes.entry(scope.to_string()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let records = match &self.db {
                    Some(db) => RecordCache::load(scope, db.clone())?,
                    None => RecordCache::in_memory(scope),
                };
                debug!("Opened record scope {}", scope);
                entry.insert(Arc::new(records)).clone()
            }
        };
        Ok(records)
    }

    fn options(&self) -> PlanOptions {
        PlanOptions {
            delete_orphans: self.config.delete_orphans,
            preserve_newer: self.config.preserve_newer,
            checkpoint_stores: self.config.checkpoint_stores,
        }
    }

    /// Plan a pass from `source_root` into `destination_root`, excluding
    /// `exclude_patterns` instead of the configured ones.
    pub fn plan(
        &self,
        source_root: &Path,
        destination_root: &Path,
        exclude_patterns: &[String],
    ) -> Result<SyncPlan, Error> {
        let matcher = PathMatcher::new(exclude_patterns)?;
        let records = self.records_for(&record_scope(destination_root))?;
        Planner {
            hasher: &self.hasher,
            records: &records,
            matcher: &matcher,
            options: self.options(),
        }
        .plan(source_root, destination_root)
    }

    /// Plan the configured pair.
    pub fn plan_configured(&self) -> Result<SyncPlan, Error> {
        Planner {
            hasher: &self.hasher,
            records: &self.records,
            matcher: &self.matcher,
            options: self.options(),
        }
        .plan(&self.config.source_root, &self.config.destination_root)
    }

    /// Plan and execute the configured pair. Errors that prevent planning
    /// produce a `Failed` run rather than an `Err`.
    pub fn run_pass(
        &self,
        trigger: RunTrigger,
        cancel: &CancellationToken,
        reporter: &dyn ProgressReporter,
    ) -> BackupRun {
        let source = self.config.source_root.display().to_string();
        reporter.on_plan_start(&source);
        let start = Instant::now();

        let plan = match self.plan_configured() {
            Ok(plan) => plan,
            Err(err) => {
                error!("Cannot plan backup of {}: {}", source, err);
                let mut run = BackupRun::new(trigger);
                run.start();
                run.fail(err.to_string());
                return run;
            }
        };
        reporter.on_plan_complete(
            plan.actions.len(),
            plan.copies().count(),
            start.elapsed().as_secs_f64(),
        );

        let run = self.execute_as(trigger, &plan, self.config.verify_after_copy, cancel, reporter);
        info!(
            "Backup pass {} -> {} finished: {}",
            source,
            self.config.destination_root.display(),
            run.status().as_str()
        );
        run
    }
}
