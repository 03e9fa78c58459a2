pub mod cancel;
pub mod checkpoint;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod hasher;
pub mod index;
pub mod matcher;
pub mod progress;
pub mod scanner;
pub mod scheduler;
pub mod storage;
pub mod sync;

pub use cancel::CancellationToken;
pub use checkpoint::{Checkpointer, SqliteCheckpointer, StoreGroup};
pub use config::AppConfig;
pub use engine::Engine;
pub use error::{Error, FailureKind};
pub use events::{EngineEvent, EventBus};
pub use index::{ContentIndex, DuplicateGroup, IndexEntry, IndexStats, IndexUpdater, ReconcileSummary};
pub use progress::{ProgressReporter, SilentReporter};
pub use scheduler::BackupScheduler;
pub use sync::{BackupRun, FileAction, RunStatus, RunTrigger, SkipReason, SyncEngine, SyncPlan};
