use chrono::Utc;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use super::{ContentIndex, IndexEntry};
use crate::config::IndexConfig;
use crate::error::{Error, FailureKind};
use crate::hasher::{ContentHasher, RecordCache};
use crate::matcher::PathMatcher;
use crate::progress::{ProgressReporter, SilentReporter};
use crate::scanner::{scan_tree, FileStamp, ScannedFile};
use crate::storage::{FileRecord, SharedDatabase};
use crate::sync::FileFailure;

/// Record scope used by the index.
pub const INDEX_SCOPE: &str = "index";

/// One change to apply to the index.
#[derive(Debug, Clone)]
pub enum IndexMutation {
    Upsert {
        entry: IndexEntry,
        text: String,
        stamp: FileStamp,
        is_new: bool,
    },
    Remove {
        path: String,
    },
}

impl IndexMutation {
    pub fn path(&self) -> &str {
        match self {
            IndexMutation::Upsert { entry, .. } => &entry.path,
            IndexMutation::Remove { path } => path,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileSummary {
    pub scanned: usize,
    pub inserted: usize,
    pub updated: usize,
    pub removed: usize,
    pub unchanged: usize,
    pub failures: Vec<FileFailure>,
}

impl ReconcileSummary {
    pub fn changed(&self) -> usize {
        self.inserted + self.updated + self.removed
    }
}

/// Reconciles a directory tree against a `ContentIndex`.
///
/// Every file is hashed (hashes are reused while size and mtime hold) so
/// duplicates can be found; text is read only for configured extensions.
pub struct IndexUpdater {
    index: Arc<ContentIndex>,
    records: RecordCache,
    hasher: Arc<ContentHasher>,
    matcher: PathMatcher,
    text_extensions: HashSet<String>,
    max_indexed_chars: usize,
    preview_chars: usize,
}

impl IndexUpdater {
    pub fn new(
        config: &IndexConfig,
        index: Arc<ContentIndex>,
        records: RecordCache,
        hasher: Arc<ContentHasher>,
    ) -> Result<Self, Error> {
        let text_extensions = config
            .text_extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_lowercase())
            .collect();
        Ok(Self {
            index,
            records,
            hasher,
            matcher: PathMatcher::new(&config.exclude_patterns)?,
            text_extensions,
            max_indexed_chars: config.max_indexed_chars,
            preview_chars: config.preview_chars,
        })
    }

    pub fn in_memory(config: &IndexConfig, index: Arc<ContentIndex>) -> Result<Self, Error> {
        Self::new(
            config,
            index,
            RecordCache::in_memory(INDEX_SCOPE),
            Arc::new(ContentHasher::new()),
        )
    }

    pub fn open(
        config: &IndexConfig,
        index: Arc<ContentIndex>,
        db: SharedDatabase,
        hasher: Arc<ContentHasher>,
    ) -> Result<Self, Error> {
        let records = RecordCache::load(INDEX_SCOPE, db)?;
        Self::new(config, index, records, hasher)
    }

    pub fn index(&self) -> &Arc<ContentIndex> {
        &self.index
    }

    pub fn hasher(&self) -> &ContentHasher {
        &self.hasher
    }

    pub fn reconcile(&self, root: &Path) -> Result<ReconcileSummary, Error> {
        self.reconcile_with(root, &SilentReporter)
    }

    /// Bring the index in line with `root`. Only entries under `root` are
    /// touched. Per-path failures are collected in the summary; an `Err`
    /// means the root itself could not be read.
    pub fn reconcile_with(
        &self,
        root: &Path,
        reporter: &dyn ProgressReporter,
    ) -> Result<ReconcileSummary, Error> {
        let root = absolute_root(root)?;
        reporter.on_index_start(&root.display().to_string());
        let start = Instant::now();

        // Phase 1: Scan
        let files = scan_tree(&root, &self.matcher).map_err(|source| Error::SourceUnreadable {
            path: root.clone(),
            source,
        })?;
        let mut summary = ReconcileSummary {
            scanned: files.len(),
            ..ReconcileSummary::default()
        };

        // Phase 2: Diff
        let (mutations, failures, unchanged) = self.compute_mutations(&root, &files);
        summary.unchanged = unchanged;
        summary.failures = failures;
        debug!(
            "{} mutations for {} ({} unchanged)",
            mutations.len(),
            root.display(),
            unchanged
        );

        // Phase 3: Apply
        let total = mutations.len();
        for (done, mutation) in mutations.into_iter().enumerate() {
            self.apply(mutation, &mut summary);
            reporter.on_index_progress(done + 1, total);
        }

        reporter.on_index_complete(summary.changed(), start.elapsed().as_secs_f64());
        info!(
            "Indexed {}: {} scanned, {} inserted, {} updated, {} removed, {} failed in {:.2}s",
            root.display(),
            summary.scanned,
            summary.inserted,
            summary.updated,
            summary.removed,
            summary.failures.len(),
            start.elapsed().as_secs_f64()
        );
        Ok(summary)
    }

    /// Mutations that bring the index in line with `files`, plus failures
    /// for files that could not be read and the count of unchanged files.
    pub fn compute_mutations(
        &self,
        root: &Path,
        files: &[ScannedFile],
    ) -> (Vec<IndexMutation>, Vec<FileFailure>, usize) {
        let outcomes: Vec<Result<Option<IndexMutation>, FileFailure>> =
            files.par_iter().map(|file| self.diff_file(file)).collect();

        let mut mutations = Vec::new();
        let mut failures = Vec::new();
        let mut unchanged = 0;
        for outcome in outcomes {
            match outcome {
                Ok(Some(mutation)) => mutations.push(mutation),
                Ok(None) => unchanged += 1,
                Err(failure) => failures.push(failure),
            }
        }

        let present: HashSet<String> = files.iter().map(|f| path_key(&f.absolute)).collect();
        for path in self.index.paths_under(root) {
            if !present.contains(&path) {
                mutations.push(IndexMutation::Remove { path });
            }
        }
        // Records for files that never made it into the index.
        for path in self.records.paths() {
            if Path::new(&path).starts_with(root)
                && !present.contains(&path)
                && self.index.get(&path).is_none()
            {
                if let Err(err) = self.records.remove(&path) {
                    warn!("Failed to drop index record for {}: {}", path, err);
                }
            }
        }
        (mutations, failures, unchanged)
    }

    fn diff_file(&self, file: &ScannedFile) -> Result<Option<IndexMutation>, FileFailure> {
        let key = path_key(&file.absolute);
        let existing = self.index.get(&key);
        if let Some(record) = self.records.get(&key) {
            if record.indexed && record.matches(file.stamp) && existing.is_some() {
                return Ok(None);
            }
        }

        let failure = |err: Error| FileFailure {
            path: key.clone(),
            kind: err.kind().unwrap_or(FailureKind::SourceUnreadable),
            message: err.to_string(),
        };
        let content_hash = self
            .records
            .content_hash(&self.hasher, &key, &file.absolute, file.stamp)
            .map_err(failure)?;
        let text = if self.is_text(&file.absolute) {
            read_text(&file.absolute, self.max_indexed_chars).map_err(|source| {
                failure(Error::SourceUnreadable {
                    path: file.absolute.clone(),
                    source,
                })
            })?
        } else {
            String::new()
        };

        let entry = IndexEntry {
            path: key,
            content_hash,
            size: file.stamp.size,
            preview: text.chars().take(self.preview_chars).collect(),
            last_indexed: Utc::now(),
        };
        Ok(Some(IndexMutation::Upsert {
            entry,
            text,
            stamp: file.stamp,
            is_new: existing.is_none(),
        }))
    }

    /// Apply one mutation. Failed upserts leave the record un-indexed so the
    /// next pass retries them.
    pub fn apply(&self, mutation: IndexMutation, summary: &mut ReconcileSummary) {
        match mutation {
            IndexMutation::Upsert {
                entry,
                text,
                stamp,
                is_new,
            } => {
                let path = entry.path.clone();
                let mut record = FileRecord::new(&path, stamp, Some(entry.content_hash));
                match self.index.upsert(entry, &text) {
                    Ok(()) => {
                        record.indexed = true;
                        if is_new {
                            summary.inserted += 1;
                        } else {
                            summary.updated += 1;
                        }
                    }
                    Err(err) => {
                        warn!("Index write failed for {}: {}", path, err);
                        summary.failures.push(FileFailure {
                            path: path.clone(),
                            kind: FailureKind::IndexWriteFailed,
                            message: err.to_string(),
                        });
                    }
                }
                if let Err(err) = self.records.put(record) {
                    warn!("Failed to persist index record for {}: {}", path, err);
                }
            }
            IndexMutation::Remove { path } => match self.index.remove(&path) {
                Ok(_) => {
                    summary.removed += 1;
                    if let Err(err) = self.records.remove(&path) {
                        warn!("Failed to drop index record for {}: {}", path, err);
                    }
                }
                Err(err) => {
                    warn!("Index removal failed for {}: {}", path, err);
                    summary.failures.push(FileFailure {
                        path,
                        kind: FailureKind::IndexWriteFailed,
                        message: err.to_string(),
                    });
                }
            },
        }
    }

    /// Remove one path from the index and forget its record.
    pub fn remove_path(&self, path: &Path) -> Result<bool, Error> {
        let key = path_key(&absolute_root(path)?);
        let removed = self.index.remove(&key)?;
        self.records.remove(&key)?;
        Ok(removed)
    }

    /// Drop index entries (and their records) under `prefix`, or everything.
    pub fn clear(&self, prefix: Option<&Path>) -> Result<usize, Error> {
        let prefix = prefix.map(absolute_root).transpose()?;
        let removed = self.index.clear(prefix.as_deref())?;
        for path in self.records.paths() {
            if prefix.as_ref().map_or(true, |p| Path::new(&path).starts_with(p)) {
                self.records.remove(&path)?;
            }
        }
        Ok(removed)
    }

    fn is_text(&self, path: &Path) -> bool {
        path.extension()
            .map(|e| self.text_extensions.contains(&e.to_string_lossy().to_lowercase()))
            .unwrap_or(false)
    }
}

fn path_key(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

pub(crate) fn absolute_root(path: &Path) -> Result<PathBuf, Error> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}

/// First `max_chars` characters of the file, decoded lossily.
fn read_text(path: &Path, max_chars: usize) -> io::Result<String> {
    let file = File::open(path)?;
    let mut bytes = Vec::new();
    // A char is at most four bytes.
    file.take((max_chars as u64).saturating_mul(4))
        .read_to_end(&mut bytes)?;
    let text = String::from_utf8_lossy(&bytes);
    Ok(text.chars().take(max_chars).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn config() -> IndexConfig {
        IndexConfig {
            exclude_patterns: vec!["*.tmp".to_string()],
            ..IndexConfig::default()
        }
    }

    #[test]
    fn test_reconcile_inserts_then_is_idempotent() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "alpha words").unwrap();
        fs::write(dir.path().join("b.bin"), [0u8, 1, 2]).unwrap();
        fs::write(dir.path().join("skip.tmp"), "ignored").unwrap();

        let index = Arc::new(ContentIndex::in_memory().unwrap());
        let updater = IndexUpdater::in_memory(&config(), index.clone()).unwrap();

        let first = updater.reconcile(dir.path()).unwrap();
        assert_eq!(first.scanned, 2);
        assert_eq!(first.inserted, 2);
        assert!(first.failures.is_empty());
        assert_eq!(index.search("alpha", 10).unwrap().len(), 1);

        let hashes = updater.hasher().hashes_computed();
        let second = updater.reconcile(dir.path()).unwrap();
        assert_eq!(second.changed(), 0);
        assert_eq!(second.unchanged, 2);
        assert_eq!(updater.hasher().hashes_computed(), hashes);
    }

    #[test]
    fn test_binary_file_has_no_text() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("image.png"), "alpha but binary").unwrap();
        let index = Arc::new(ContentIndex::in_memory().unwrap());
        let updater = IndexUpdater::in_memory(&config(), index.clone()).unwrap();
        updater.reconcile(dir.path()).unwrap();

        let key = path_key(&dir.path().join("image.png"));
        assert_eq!(index.get(&key).unwrap().preview, "");
        assert!(index.search("binary", 10).unwrap().is_empty());
        assert_eq!(index.search("png", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_deleted_and_renamed_files_reconcile() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("old.txt"), "rename me").unwrap();
        fs::write(dir.path().join("gone.txt"), "delete me").unwrap();
        let index = Arc::new(ContentIndex::in_memory().unwrap());
        let updater = IndexUpdater::in_memory(&config(), index.clone()).unwrap();
        updater.reconcile(dir.path()).unwrap();

        fs::rename(dir.path().join("old.txt"), dir.path().join("new.txt")).unwrap();
        fs::remove_file(dir.path().join("gone.txt")).unwrap();
        let summary = updater.reconcile(dir.path()).unwrap();
        assert_eq!(summary.inserted, 1);
        assert_eq!(summary.removed, 2);

        let paths: Vec<String> = index.entries().into_iter().map(|e| e.path).collect();
        assert_eq!(paths, vec![path_key(&dir.path().join("new.txt"))]);
    }

    #[test]
    fn test_text_truncated_and_preview_bounded() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("long.md"), "word ".repeat(100)).unwrap();
        let config = IndexConfig {
            max_indexed_chars: 50,
            preview_chars: 8,
            ..config()
        };
        let index = Arc::new(ContentIndex::in_memory().unwrap());
        let updater = IndexUpdater::in_memory(&config, index.clone()).unwrap();
        updater.reconcile(dir.path()).unwrap();

        let hits = index.search("word", 10).unwrap();
        assert_eq!(hits[0].score, 10);
        assert_eq!(hits[0].entry.preview, "word wor");
    }

    #[test]
    fn test_reconcile_leaves_other_roots_alone() {
        let one = tempdir().unwrap();
        let two = tempdir().unwrap();
        fs::write(one.path().join("a.txt"), "one").unwrap();
        fs::write(two.path().join("b.txt"), "two").unwrap();
        let index = Arc::new(ContentIndex::in_memory().unwrap());
        let updater = IndexUpdater::in_memory(&config(), index.clone()).unwrap();
        updater.reconcile(one.path()).unwrap();
        updater.reconcile(two.path()).unwrap();
        assert_eq!(index.len(), 2);
    }
}
