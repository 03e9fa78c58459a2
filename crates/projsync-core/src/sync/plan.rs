use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::checkpoint::{detect_groups, StoreGroup};
use crate::error::Error;
use crate::hasher::{ContentHasher, RecordCache};
use crate::matcher::PathMatcher;
use crate::scanner::{relative_key, scan_tree, FileStamp, ScannedFile};
use crate::storage::FileRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Unchanged,
    /// Metadata changed but the content hash did not.
    ContentUnchanged,
    DestinationNewer,
    /// `-wal` / `-shm` member of a store group; travels with its main file.
    StoreSidecar,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SkipReason::Unchanged => "unchanged",
            SkipReason::ContentUnchanged => "content unchanged",
            SkipReason::DestinationNewer => "destination newer",
            SkipReason::StoreSidecar => "store sidecar",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FileAction {
    Copy {
        relative: String,
        src: PathBuf,
        dst: PathBuf,
        size: u64,
        /// Set when `src` is the main file of a store group that must be
        /// checkpointed first.
        group: Option<StoreGroup>,
    },
    Skip {
        relative: String,
        reason: SkipReason,
        /// Record to store when the skip is executed (new stamp, same hash).
        refresh: Option<FileRecord>,
    },
    Delete {
        relative: String,
        dst: PathBuf,
    },
}

impl FileAction {
    pub fn relative(&self) -> &str {
        match self {
            FileAction::Copy { relative, .. }
            | FileAction::Skip { relative, .. }
            | FileAction::Delete { relative, .. } => relative,
        }
    }

    pub fn is_copy(&self) -> bool {
        matches!(self, FileAction::Copy { .. })
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, FileAction::Delete { .. })
    }
}

/// Ordered file actions for one pass, sorted by relative path.
#[derive(Debug, Clone)]
pub struct SyncPlan {
    pub source_root: PathBuf,
    pub destination_root: PathBuf,
    /// Scope of the records this plan was computed against; execution
    /// updates the same scope.
    pub record_scope: String,
    pub actions: Vec<FileAction>,
    /// Source paths whose destination would escape the destination root.
    pub rejected: Vec<String>,
}

impl SyncPlan {
    pub fn copies(&self) -> impl Iterator<Item = &FileAction> {
        self.actions.iter().filter(|a| a.is_copy())
    }

    pub fn deletes(&self) -> impl Iterator<Item = &FileAction> {
        self.actions.iter().filter(|a| a.is_delete())
    }

    pub fn skips(&self) -> impl Iterator<Item = &FileAction> {
        self.actions
            .iter()
            .filter(|a| matches!(a, FileAction::Skip { .. }))
    }

    pub fn copy_bytes(&self) -> u64 {
        self.actions
            .iter()
            .map(|a| match a {
                FileAction::Copy { size, .. } => *size,
                _ => 0,
            })
            .sum()
    }

    /// No copies and no deletes.
    pub fn is_noop(&self) -> bool {
        self.copies().next().is_none() && self.deletes().next().is_none()
    }

    pub fn action_for(&self, relative: &str) -> Option<&FileAction> {
        self.actions.iter().find(|a| a.relative() == relative)
    }
}

/// Join a `/`-separated relative path onto `root`, accepting only normal
/// components so the result cannot leave `root`.
pub fn safe_join(root: &Path, relative: &str) -> Result<PathBuf, Error> {
    let rejected = || Error::PathTraversalRejected {
        path: PathBuf::from(relative),
    };
    let rel = Path::new(relative);
    if relative.is_empty() {
        return Err(rejected());
    }
    let mut joined = root.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => joined.push(part),
            _ => return Err(rejected()),
        }
    }
    Ok(joined)
}

#[derive(Debug, Clone, Copy, Default)]
pub struct PlanOptions {
    pub delete_orphans: bool,
    pub preserve_newer: bool,
    pub checkpoint_stores: bool,
}

#[derive(Debug)]
enum Decision {
    Unchanged,
    ContentUnchanged(FileRecord),
    DestinationNewer,
    Changed,
}

pub(crate) struct Planner<'a> {
    pub hasher: &'a ContentHasher,
    pub records: &'a RecordCache,
    pub matcher: &'a PathMatcher,
    pub options: PlanOptions,
}

impl Planner<'_> {
    pub fn plan(&self, source_root: &Path, destination_root: &Path) -> Result<SyncPlan, Error> {
        let start = Instant::now();
        let files = scan_tree(source_root, self.matcher).map_err(|source| {
            Error::SourceUnreadable {
                path: source_root.to_path_buf(),
                source,
            }
        })?;

        let groups = if self.options.checkpoint_stores {
            let relatives: Vec<PathBuf> = files.iter().map(|f| PathBuf::from(&f.relative)).collect();
            detect_groups(&relatives)
        } else {
            Vec::new()
        };
        let mut group_by_main: HashMap<String, StoreGroup> = HashMap::new();
        let mut sidecars: HashSet<String> = HashSet::new();
        for group in groups {
            for sidecar in group.sidecars() {
                sidecars.insert(relative_key(sidecar));
            }
            group_by_main.insert(relative_key(&group.main), group);
        }
        let by_relative: HashMap<&str, &ScannedFile> =
            files.iter().map(|f| (f.relative.as_str(), f)).collect();

        let mut actions: BTreeMap<String, FileAction> = BTreeMap::new();
        let mut rejected = Vec::new();

        for file in &files {
            let dst = match safe_join(destination_root, &file.relative) {
                Ok(dst) => dst,
                Err(err) => {
                    warn!("{}", err);
                    rejected.push(file.relative.clone());
                    continue;
                }
            };

            if sidecars.contains(&file.relative) {
                actions.insert(
                    file.relative.clone(),
                    FileAction::Skip {
                        relative: file.relative.clone(),
                        reason: SkipReason::StoreSidecar,
                        refresh: None,
                    },
                );
                continue;
            }

            let group = group_by_main.get(&file.relative);
            let mut decision = self.decide(file, &dst);
            if let Some(group) = group {
                let sidecar_changed = group.sidecars().iter().any(|sidecar| {
                    let key = relative_key(sidecar);
                    match (by_relative.get(key.as_str()), self.records.get(&key)) {
                        (Some(scanned), Some(record)) => !record.matches(scanned.stamp),
                        _ => true,
                    }
                });
                if sidecar_changed && !matches!(decision, Decision::DestinationNewer) {
                    decision = Decision::Changed;
                }
            }

            let action = match decision {
                Decision::Unchanged => FileAction::Skip {
                    relative: file.relative.clone(),
                    reason: SkipReason::Unchanged,
                    refresh: None,
                },
                Decision::ContentUnchanged(record) => FileAction::Skip {
                    relative: file.relative.clone(),
                    reason: SkipReason::ContentUnchanged,
                    refresh: Some(record),
                },
                Decision::DestinationNewer => FileAction::Skip {
                    relative: file.relative.clone(),
                    reason: SkipReason::DestinationNewer,
                    refresh: None,
                },
                Decision::Changed => FileAction::Copy {
                    relative: file.relative.clone(),
                    src: file.absolute.clone(),
                    dst,
                    size: file.stamp.size,
                    group: group.map(|g| absolute_group(source_root, g)),
                },
            };
            actions.insert(file.relative.clone(), action);
        }

        // Recorded paths that have left the source.
        for recorded in self.records.paths() {
            if by_relative.contains_key(recorded.as_str())
                || self.matcher.matches(Path::new(&recorded))
            {
                continue;
            }
            match safe_join(destination_root, &recorded) {
                Ok(dst) => {
                    actions.insert(
                        recorded.clone(),
                        FileAction::Delete {
                            relative: recorded,
                            dst,
                        },
                    );
                }
                Err(err) => {
                    warn!("{}", err);
                    rejected.push(recorded);
                }
            }
        }

        if self.options.delete_orphans {
            for orphan in self.destination_orphans(destination_root, &by_relative)? {
                if actions.contains_key(&orphan.relative) {
                    continue;
                }
                actions.insert(
                    orphan.relative.clone(),
                    FileAction::Delete {
                        relative: orphan.relative,
                        dst: orphan.absolute,
                    },
                );
            }
        }

        let plan = SyncPlan {
            source_root: source_root.to_path_buf(),
            destination_root: destination_root.to_path_buf(),
            record_scope: self.records.scope().to_string(),
            actions: actions.into_values().collect(),
            rejected,
        };
        info!(
            "Planned {} actions ({} copies, {} deletes) for {} in {:.2}s",
            plan.actions.len(),
            plan.copies().count(),
            plan.deletes().count(),
            source_root.display(),
            start.elapsed().as_secs_f64()
        );
        Ok(plan)
    }

    fn decide(&self, file: &ScannedFile, dst: &Path) -> Decision {
        let dst_stamp = match fs::metadata(dst) {
            Ok(meta) if meta.is_file() => Some(FileStamp::from_metadata(&meta)),
            _ => None,
        };

        if self.options.preserve_newer {
            if let Some(dst_stamp) = dst_stamp {
                if dst_stamp.modified > file.stamp.modified {
                    return Decision::DestinationNewer;
                }
            }
        }

        let dst_same_size = dst_stamp.map_or(false, |s| s.size == file.stamp.size);
        let record = match self.records.get(&file.relative) {
            Some(record) if dst_same_size => record,
            _ => return Decision::Changed,
        };
        if record.matches(file.stamp) {
            return Decision::Unchanged;
        }
        if record.size != file.stamp.size {
            return Decision::Changed;
        }

        // Only the mtime moved: compare content before deciding to copy.
        let Some(recorded_hash) = record.content_hash else {
            return Decision::Changed;
        };
        match self.hasher.hash(&file.absolute) {
            Ok(hash) if hash == recorded_hash => {
                debug!("{} touched but content unchanged", file.relative);
                Decision::ContentUnchanged(FileRecord::new(&file.relative, file.stamp, Some(hash)))
            }
            Ok(_) => Decision::Changed,
            Err(err) => {
                debug!("Hash during planning failed, leaving it to the copy: {}", err);
                Decision::Changed
            }
        }
    }

    fn destination_orphans(
        &self,
        destination_root: &Path,
        source: &HashMap<&str, &ScannedFile>,
    ) -> Result<Vec<ScannedFile>, Error> {
        let files = match scan_tree(destination_root, self.matcher) {
            Ok(files) => files,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(Error::DestinationWriteFailed {
                    path: destination_root.to_path_buf(),
                    source,
                })
            }
        };
        Ok(files
            .into_iter()
            .filter(|f| !source.contains_key(f.relative.as_str()))
            .collect())
    }
}

fn absolute_group(root: &Path, group: &StoreGroup) -> StoreGroup {
    StoreGroup {
        main: root.join(&group.main),
        wal: group.wal.as_ref().map(|p| root.join(p)),
        shm: group.shm.as_ref().map(|p| root.join(p)),
    }
}
