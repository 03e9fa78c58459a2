use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::cancel::CancellationToken;
use crate::error::Error;
use crate::events::{EngineEvent, EventBus};
use crate::progress::{ProgressReporter, SilentReporter};
use crate::storage::{lock_shared, SharedDatabase};
use crate::sync::{BackupRun, RunStatus, RunTrigger, SyncEngine};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

struct SchedulerInner {
    engine: SyncEngine,
    db: Option<SharedDatabase>,
    events: Arc<EventBus>,
    reporter: Arc<dyn ProgressReporter>,
    history_limit: usize,
    /// Sole mutual exclusion point for passes.
    active: AtomicBool,
    cancel: Mutex<Option<CancellationToken>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    last_run: Mutex<Option<BackupRun>>,
    history: Mutex<VecDeque<BackupRun>>,
}

/// Runs backup passes on a worker thread, one at a time.
///
/// Scheduled ticks that find a pass active are skipped; manual triggers are
/// rejected with `Error::Busy`. Nothing is ever queued.
#[derive(Clone)]
pub struct BackupScheduler {
    inner: Arc<SchedulerInner>,
}

impl BackupScheduler {
    pub fn new(engine: SyncEngine, events: Arc<EventBus>, history_limit: usize) -> Self {
        Self {
            inner: Arc::new(SchedulerInner {
                engine,
                db: None,
                events,
                reporter: Arc::new(SilentReporter),
                history_limit: history_limit.max(1),
                active: AtomicBool::new(false),
                cancel: Mutex::new(None),
                worker: Mutex::new(None),
                last_run: Mutex::new(None),
                history: Mutex::new(VecDeque::new()),
            }),
        }
    }

    /// Persist run history in `db`. Must be called before the scheduler is shared.
    pub fn with_database(self, db: SharedDatabase) -> Self {
        self.rebuild(|inner| inner.db = Some(db))
    }

    pub fn with_reporter(self, reporter: Arc<dyn ProgressReporter>) -> Self {
        self.rebuild(|inner| inner.reporter = reporter)
    }

    fn rebuild(self, f: impl FnOnce(&mut SchedulerInner)) -> Self {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                f(&mut inner);
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(shared) => {
                warn!("Scheduler already shared; configuration change ignored");
                Self { inner: shared }
            }
        }
    }

    pub fn engine(&self) -> &SyncEngine {
        &self.inner.engine
    }

    pub fn is_run_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    pub fn last_run_result(&self) -> Option<BackupRun> {
        lock(&self.inner.last_run).clone()
    }

    /// Periodic trigger. Returns false if the tick was skipped.
    pub fn tick(&self) -> bool {
        match self.begin(RunTrigger::Scheduled) {
            Ok(()) => true,
            Err(Error::Busy) => {
                debug!("Scheduled backup skipped: a run is already active");
                self.inner.events.publish(EngineEvent::BackupSkipped {
                    trigger: RunTrigger::Scheduled,
                });
                false
            }
            Err(err) => {
                error!("Scheduled backup could not start: {}", err);
                false
            }
        }
    }

    pub fn start_manual_backup(&self) -> Result<(), Error> {
        self.begin(RunTrigger::Manual)
    }

    /// Ask the active pass to stop after its current file.
    pub fn cancel_active_run(&self) -> bool {
        match lock(&self.inner.cancel).as_ref() {
            Some(token) => {
                info!("Cancelling active backup run");
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Block until the current worker (if any) has finished; returns the last run.
    pub fn wait(&self) -> Option<BackupRun> {
        let handle = lock(&self.inner.worker).take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("Backup worker panicked");
            }
        }
        self.last_run_result()
    }

    /// Most recent runs first.
    pub fn history(&self, limit: usize) -> Result<Vec<BackupRun>, Error> {
        match &self.inner.db {
            Some(db) => Ok(lock_shared(db)?.list_backup_runs(limit)?),
            None => Ok(lock(&self.inner.history).iter().take(limit).cloned().collect()),
        }
    }

    fn begin(&self, trigger: RunTrigger) -> Result<(), Error> {
        if self
            .inner
            .active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(Error::Busy);
        }

        let token = CancellationToken::new();
        *lock(&self.inner.cancel) = Some(token.clone());

        // Reap the previous worker; it has already cleared the active flag.
        let previous = lock(&self.inner.worker).take();
        if let Some(previous) = previous {
            let _ = previous.join();
        }

        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("projsync-backup".to_string())
            .spawn(move || run_worker(&inner, trigger, &token));
        match spawned {
            Ok(handle) => {
                *lock(&self.inner.worker) = Some(handle);
                info!("{} backup started", trigger.as_str());
                Ok(())
            }
            Err(err) => {
                *lock(&self.inner.cancel) = None;
                self.inner.active.store(false, Ordering::Release);
                Err(Error::Io(err))
            }
        }
    }

    /// Start the periodic timer thread.
    pub fn spawn(&self, interval: Duration) -> Result<SchedulerHandle, Error> {
        let token = CancellationToken::new();
        let scheduler = self.clone();
        let timer_token = token.clone();
        let thread = thread::Builder::new()
            .name("projsync-scheduler".to_string())
            .spawn(move || {
                info!("Backup scheduler running every {:?}", interval);
                while !timer_token.wait_timeout(interval) {
                    scheduler.tick();
                }
                debug!("Backup scheduler timer stopped");
            })?;
        Ok(SchedulerHandle {
            token,
            thread: Some(thread),
            scheduler: self.clone(),
        })
    }
}

fn run_worker(inner: &SchedulerInner, trigger: RunTrigger, cancel: &CancellationToken) {
    inner.events.publish(EngineEvent::BackupStarted { trigger });
    let mut run = inner.engine.run_pass(trigger, cancel, inner.reporter.as_ref());

    if let Some(db) = &inner.db {
        let persisted = lock_shared(db).and_then(|guard| {
            let id = guard.insert_backup_run(&run)?;
            guard.prune_backup_runs(inner.history_limit)?;
            Ok(id)
        });
        match persisted {
            Ok(id) => run.set_id(id),
            Err(err) => error!("Failed to persist backup run: {}", err),
        }
    }
    {
        let mut history = lock(&inner.history);
        history.push_front(run.clone());
        history.truncate(inner.history_limit);
    }

    if run.status() == RunStatus::Failed {
        inner.events.publish(EngineEvent::BackupError {
            message: run
                .abort_reason()
                .unwrap_or("backup run failed")
                .to_string(),
        });
    }
    inner
        .events
        .publish(EngineEvent::BackupCompleted { run: run.clone() });

    *lock(&inner.last_run) = Some(run);
    *lock(&inner.cancel) = None;
    inner.active.store(false, Ordering::Release);
}

/// Owns the timer thread. `shutdown` (or drop) stops the timer, cancels any
/// active pass and joins both threads.
pub struct SchedulerHandle {
    token: CancellationToken,
    thread: Option<JoinHandle<()>>,
    scheduler: BackupScheduler,
}

impl SchedulerHandle {
    pub fn scheduler(&self) -> &BackupScheduler {
        &self.scheduler
    }

    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.token.cancel();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Scheduler timer thread panicked");
            }
            self.scheduler.cancel_active_run();
            self.scheduler.wait();
            info!("Backup scheduler shut down");
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
