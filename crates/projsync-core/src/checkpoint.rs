use rusqlite::{Connection, OpenFlags};
use std::collections::{BTreeMap, HashSet};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::Error;

pub const WAL_SUFFIX: &str = "-wal";
pub const SHM_SUFFIX: &str = "-shm";

/// An embedded transactional store: main file plus whichever of its
/// write-ahead log and shared-memory index currently exist.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StoreGroup {
    pub main: PathBuf,
    pub wal: Option<PathBuf>,
    pub shm: Option<PathBuf>,
}

impl StoreGroup {
    pub fn members(&self) -> Vec<&Path> {
        let mut members = vec![self.main.as_path()];
        members.extend(self.wal.as_deref());
        members.extend(self.shm.as_deref());
        members
    }

    pub fn sidecars(&self) -> Vec<&Path> {
        self.wal.iter().chain(self.shm.iter()).map(PathBuf::as_path).collect()
    }

    pub fn contains(&self, path: &Path) -> bool {
        self.members().iter().any(|m| *m == path)
    }
}

/// If `path` names a sidecar (`<main>-wal` / `<main>-shm`), the main file it belongs to.
pub fn sidecar_main(path: &Path) -> Option<PathBuf> {
    let name = path.file_name()?.to_string_lossy();
    let stem = name
        .strip_suffix(WAL_SUFFIX)
        .or_else(|| name.strip_suffix(SHM_SUFFIX))?;
    if stem.is_empty() {
        return None;
    }
    Some(path.with_file_name(OsString::from(stem)))
}

/// Group store files among `paths`. A main file without any sidecar present
/// is not a group, and neither are sidecars whose main file is absent.
pub fn detect_groups<P: AsRef<Path>>(paths: &[P]) -> Vec<StoreGroup> {
    let present: HashSet<&Path> = paths.iter().map(|p| p.as_ref()).collect();
    let mut groups: BTreeMap<PathBuf, StoreGroup> = BTreeMap::new();

    for path in paths.iter().map(|p| p.as_ref()) {
        let main = match sidecar_main(path) {
            Some(main) if present.contains(main.as_path()) => main,
            _ => continue,
        };
        let group = groups.entry(main.clone()).or_insert_with(|| StoreGroup {
            main,
            wal: None,
            shm: None,
        });
        let name = path.file_name().map(|n| n.to_string_lossy().into_owned());
        match name {
            Some(n) if n.ends_with(WAL_SUFFIX) => group.wal = Some(path.to_path_buf()),
            Some(_) => group.shm = Some(path.to_path_buf()),
            None => {}
        }
    }

    groups.into_values().collect()
}

/// Forces a store group into a consistent state before any member is read.
pub trait Checkpointer: Send + Sync {
    fn checkpoint(&self, group: &StoreGroup) -> Result<(), Error>;
}

/// Checkpoints SQLite databases with `PRAGMA wal_checkpoint(TRUNCATE)`.
#[derive(Debug, Clone)]
pub struct SqliteCheckpointer {
    busy_timeout: Duration,
}

impl Default for SqliteCheckpointer {
    fn default() -> Self {
        Self {
            busy_timeout: Duration::from_secs(5),
        }
    }
}

impl SqliteCheckpointer {
    pub fn with_busy_timeout(busy_timeout: Duration) -> Self {
        Self { busy_timeout }
    }
}

impl Checkpointer for SqliteCheckpointer {
    fn checkpoint(&self, group: &StoreGroup) -> Result<(), Error> {
        let failed = |reason: String| Error::CheckpointFailed {
            path: group.main.clone(),
            reason,
        };

        // Never create: the file must already be a database.
        let conn = Connection::open_with_flags(
            &group.main,
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(|e| failed(format!("open: {}", e)))?;
        conn.busy_timeout(self.busy_timeout)
            .map_err(|e| failed(format!("busy timeout: {}", e)))?;

        let (busy, log_frames, checkpointed): (i64, i64, i64) = conn
            .query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?))
            })
            .map_err(|e| failed(e.to_string()))?;

        if busy != 0 {
            warn!(
                "Checkpoint of {} blocked ({} of {} frames checkpointed)",
                group.main.display(),
                checkpointed,
                log_frames
            );
            return Err(failed(format!(
                "database busy: {} of {} WAL frames checkpointed",
                checkpointed, log_frames
            )));
        }

        debug!(
            "Checkpointed {} ({} WAL frames folded in)",
            group.main.display(),
            checkpointed.max(0)
        );
        Ok(())
    }
}
