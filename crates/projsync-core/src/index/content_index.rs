use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::sync::{Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use super::tokenize::{term_frequencies, tokenize};
use super::{DuplicateGroup, IndexEntry, IndexStats, SearchHit};
use crate::error::Error;
use crate::hasher::ContentHash;
use crate::storage::{lock_shared, Database, SharedDatabase};

#[derive(Default)]
struct IndexState {
    entries: BTreeMap<String, IndexEntry>,
    by_hash: HashMap<ContentHash, BTreeSet<String>>,
}

impl IndexState {
    fn insert(&mut self, entry: IndexEntry) {
        self.remove(&entry.path);
        self.by_hash
            .entry(entry.content_hash)
            .or_default()
            .insert(entry.path.clone());
        self.entries.insert(entry.path.clone(), entry);
    }

    fn remove(&mut self, path: &str) -> bool {
        let Some(entry) = self.entries.remove(path) else {
            return false;
        };
        if let Some(paths) = self.by_hash.get_mut(&entry.content_hash) {
            paths.remove(path);
            if paths.is_empty() {
                self.by_hash.remove(&entry.content_hash);
            }
        }
        true
    }
}

fn under(path: &str, root: Option<&Path>) -> bool {
    root.map_or(true, |root| Path::new(path).starts_with(root))
}

/// Full-text index over an FTS5 table, plus a hash -> paths map for
/// duplicate detection.
///
/// Entry metadata is mirrored in memory; indexed text lives only in the
/// store. Mutations are serialized by a writer mutex, the store is written
/// first and memory changes only if that succeeds.
pub struct ContentIndex {
    state: RwLock<IndexState>,
    writer: Mutex<()>,
    db: SharedDatabase,
}

impl ContentIndex {
    /// Index backed by a private in-memory database.
    pub fn in_memory() -> Result<Self, Error> {
        Self::open(Database::open_in_memory()?.into_shared())
    }

    pub fn open(db: SharedDatabase) -> Result<Self, Error> {
        let mut state = IndexState::default();
        let stored = lock_shared(&db)?.load_index_entries()?;
        let count = stored.len();
        for entry in stored {
            state.insert(entry);
        }
        info!("Content index loaded {} entries", count);
        Ok(Self {
            state: RwLock::new(state),
            writer: Mutex::new(()),
            db,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, IndexState> {
        match self.state.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn write(&self) -> RwLockWriteGuard<'_, IndexState> {
        match self.state.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn lock_writer(&self) -> MutexGuard<'_, ()> {
        match self.writer.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn upsert(&self, entry: IndexEntry, text: &str) -> Result<(), Error> {
        let _writer = self.lock_writer();
        lock_shared(&self.db)?
            .upsert_index_entry(&entry, text)
            .map_err(|source| Error::IndexWriteFailed {
                path: entry.path.clone(),
                source,
            })?;
        debug!("Indexed {}", entry.path);
        self.write().insert(entry);
        Ok(())
    }

    pub fn remove(&self, path: &str) -> Result<bool, Error> {
        let _writer = self.lock_writer();
        lock_shared(&self.db)?
            .delete_index_entry(path)
            .map_err(|source| Error::IndexWriteFailed {
                path: path.to_string(),
                source,
            })?;
        Ok(self.write().remove(path))
    }

    /// Remove every entry under `prefix`, or all entries when `None`.
    pub fn clear(&self, prefix: Option<&Path>) -> Result<usize, Error> {
        let _writer = self.lock_writer();
        let doomed: Vec<String> = match prefix {
            Some(prefix) => self.paths_under(prefix),
            None => self.read().entries.keys().cloned().collect(),
        };
        if doomed.is_empty() {
            return Ok(0);
        }
        lock_shared(&self.db)?
            .delete_index_entries(&doomed)
            .map_err(|source| Error::IndexWriteFailed {
                path: prefix
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "*".to_string()),
                source,
            })?;
        let mut state = self.write();
        for path in &doomed {
            state.remove(path);
        }
        info!("Cleared {} index entries", doomed.len());
        Ok(doomed.len())
    }

    pub fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>, Error> {
        self.search_in(query, limit, None)
    }

    /// Entries under `root` (all entries when `None`) ranked by the summed
    /// term frequency of the query's distinct tokens; ties go to the
    /// lexicographically smaller path. The store narrows the candidates,
    /// scoring happens here.
    pub fn search_in(
        &self,
        query: &str,
        limit: usize,
        root: Option<&Path>,
    ) -> Result<Vec<SearchHit>, Error> {
        let tokens: BTreeSet<String> = tokenize(query).collect();
        if tokens.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let expr = tokens
            .iter()
            .map(|t| format!("\"{}\"", t))
            .collect::<Vec<_>>()
            .join(" OR ");
        let candidates = lock_shared(&self.db)?.search_index_text(&expr)?;

        let state = self.read();
        let mut hits: Vec<SearchHit> = candidates
            .into_iter()
            .filter(|(path, _)| under(path, root))
            .filter_map(|(path, body)| {
                let entry = state.entries.get(&path)?;
                let terms = term_frequencies(&path, &body);
                let score: u64 = tokens
                    .iter()
                    .filter_map(|t| terms.get(t))
                    .map(|tf| u64::from(*tf))
                    .sum();
                (score > 0).then(|| SearchHit {
                    entry: entry.clone(),
                    score,
                })
            })
            .collect();
        hits.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.entry.path.cmp(&b.entry.path))
        });
        hits.truncate(limit);
        Ok(hits)
    }

    pub fn duplicates(&self) -> Vec<DuplicateGroup> {
        self.duplicates_in(None)
    }

    /// Groups of two or more paths under `root` sharing a content hash.
    pub fn duplicates_in(&self, root: Option<&Path>) -> Vec<DuplicateGroup> {
        let state = self.read();
        let mut groups: Vec<DuplicateGroup> = state
            .by_hash
            .iter()
            .filter_map(|(hash, paths)| {
                let paths: Vec<String> = paths.iter().filter(|p| under(p, root)).cloned().collect();
                (paths.len() >= 2).then(|| DuplicateGroup {
                    content_hash: *hash,
                    paths,
                })
            })
            .collect();
        groups.sort_by(|a, b| a.paths.first().cmp(&b.paths.first()));
        groups
    }

    pub fn get(&self, path: &str) -> Option<IndexEntry> {
        self.read().entries.get(path).cloned()
    }

    /// All entries, sorted by path.
    pub fn entries(&self) -> Vec<IndexEntry> {
        self.read().entries.values().cloned().collect()
    }

    pub fn paths_under(&self, root: &Path) -> Vec<String> {
        self.read()
            .entries
            .keys()
            .filter(|p| under(p, Some(root)))
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    pub fn statistics(&self) -> IndexStats {
        self.statistics_in(None)
    }

    pub fn statistics_in(&self, root: Option<&Path>) -> IndexStats {
        let duplicate_groups = self.duplicates_in(root).len();
        let state = self.read();
        let mut stats = IndexStats {
            duplicate_groups,
            ..IndexStats::default()
        };
        for entry in state.entries.values().filter(|e| under(&e.path, root)) {
            stats.file_count += 1;
            stats.total_bytes += entry.size;
            let ext = Path::new(&entry.path)
                .extension()
                .map(|e| e.to_string_lossy().to_lowercase())
                .unwrap_or_default();
            *stats.by_extension.entry(ext).or_insert(0) += 1;
            stats.last_indexed = stats.last_indexed.max(Some(entry.last_indexed));
        }
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use tempfile::tempdir;

    fn entry(path: &str, content: &str) -> IndexEntry {
        IndexEntry {
            path: path.to_string(),
            content_hash: ContentHash::of_bytes(content.as_bytes()),
            size: content.len() as u64,
            preview: content.chars().take(20).collect(),
            last_indexed: Utc::now(),
        }
    }

    #[test]
    fn test_search_ranks_by_term_frequency_then_path() {
        let index = ContentIndex::in_memory().unwrap();
        index.upsert(entry("/p/b.txt", "alpha"), "alpha").unwrap();
        index.upsert(entry("/p/a.txt", "alpha"), "alpha").unwrap();
        index
            .upsert(entry("/p/c.txt", "alpha alpha beta"), "alpha alpha beta")
            .unwrap();

        let hits = index.search("Alpha", 10).unwrap();
        let paths: Vec<&str> = hits.iter().map(|h| h.entry.path.as_str()).collect();
        assert_eq!(paths, vec!["/p/c.txt", "/p/a.txt", "/p/b.txt"]);
        assert_eq!(hits[0].score, 2);

        // Repeated query tokens count once.
        assert_eq!(index.search("beta beta", 10).unwrap()[0].score, 1);
        assert!(index.search("gamma", 10).unwrap().is_empty());
        assert_eq!(index.search("alpha", 1).unwrap().len(), 1);
    }

    #[test]
    fn test_duplicates_follow_content_changes() {
        let index = ContentIndex::in_memory().unwrap();
        index.upsert(entry("/p/a.txt", "hello"), "hello").unwrap();
        index.upsert(entry("/p/b.txt", "hello"), "hello").unwrap();
        index.upsert(entry("/p/c.txt", "other"), "other").unwrap();

        let groups = index.duplicates();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].content_hash, ContentHash::of_bytes(b"hello"));
        assert_eq!(groups[0].paths, vec!["/p/a.txt", "/p/b.txt"]);

        index.upsert(entry("/p/b.txt", "changed"), "changed").unwrap();
        assert!(index.duplicates().is_empty());
    }

    #[test]
    fn test_remove_drops_text_rows() {
        let index = ContentIndex::in_memory().unwrap();
        index.upsert(entry("/p/a.txt", "needle"), "needle").unwrap();
        assert!(index.remove("/p/a.txt").unwrap());
        assert!(!index.remove("/p/a.txt").unwrap());
        assert!(index.search("needle", 10).unwrap().is_empty());
        assert!(index.is_empty());
    }

    #[test]
    fn test_clear_prefix_only_touches_that_root() {
        let index = ContentIndex::in_memory().unwrap();
        index.upsert(entry("/one/a.txt", "x"), "x").unwrap();
        index.upsert(entry("/one/sub/b.txt", "y"), "y").unwrap();
        index.upsert(entry("/onetwo/c.txt", "z"), "z").unwrap();
        assert_eq!(index.clear(Some(Path::new("/one"))).unwrap(), 2);
        assert_eq!(index.len(), 1);
        assert_eq!(index.clear(None).unwrap(), 1);
    }

    #[test]
    fn test_statistics() {
        let index = ContentIndex::in_memory().unwrap();
        index.upsert(entry("/p/a.TXT", "hello"), "hello").unwrap();
        index.upsert(entry("/p/b.txt", "hello"), "hello").unwrap();
        index.upsert(entry("/p/Makefile", "all:"), "all:").unwrap();
        let stats = index.statistics();
        assert_eq!(stats.file_count, 3);
        assert_eq!(stats.total_bytes, 14);
        assert_eq!(stats.duplicate_groups, 1);
        assert_eq!(stats.by_extension.get("txt"), Some(&2));
        assert_eq!(stats.by_extension.get(""), Some(&1));
        assert!(stats.last_indexed.is_some());
    }

    #[test]
    fn test_reopen_keeps_text_searchable() {
        let dir = tempdir().unwrap();
        let db = Database::open(dir.path().join("index.db"))
            .unwrap()
            .into_shared();
        {
            let index = ContentIndex::open(db.clone()).unwrap();
            index
                .upsert(entry("/p/readme.md", "persistent words"), "persistent words")
                .unwrap();
            index.upsert(entry("/p/copy.md", "persistent words"), "persistent words").unwrap();
        }
        let reopened = ContentIndex::open(db).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.search("persistent", 10).unwrap().len(), 2);
        assert_eq!(reopened.duplicates().len(), 1);
        assert_eq!(
            reopened.get("/p/readme.md").unwrap().preview,
            "persistent words"
        );
    }

    #[test]
    fn test_queries_scoped_to_root() {
        let index = ContentIndex::in_memory().unwrap();
        index.upsert(entry("/one/a.txt", "shared words"), "shared words").unwrap();
        index.upsert(entry("/one/b.txt", "shared words"), "shared words").unwrap();
        index.upsert(entry("/two/c.txt", "shared words"), "shared words").unwrap();
        index.upsert(entry("/two/d.md", "other"), "other").unwrap();
        let one = Some(Path::new("/one"));
        let two = Some(Path::new("/two"));

        let hits = index.search_in("shared", 10, two).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].entry.path, "/two/c.txt");
        assert_eq!(index.search("shared", 10).unwrap().len(), 3);

        assert_eq!(index.duplicates()[0].paths.len(), 3);
        assert_eq!(index.duplicates_in(one)[0].paths, vec!["/one/a.txt", "/one/b.txt"]);
        assert!(index.duplicates_in(two).is_empty());

        let stats = index.statistics_in(two);
        assert_eq!(stats.file_count, 2);
        assert_eq!(stats.duplicate_groups, 0);
        assert_eq!(stats.by_extension.get("md"), Some(&1));
        assert_eq!(index.statistics().duplicate_groups, 1);
    }

    #[test]
    fn test_text_lives_in_full_text_table() {
        let db = Database::open_in_memory().unwrap().into_shared();
        let index = ContentIndex::open(db.clone()).unwrap();
        index.upsert(entry("/p/todo_list.md", "ship it"), "ship it").unwrap();
        index.upsert(entry("/p/todo_list.md", "ship later"), "ship later").unwrap();

        let guard = db.lock().unwrap();
        let rows = guard.search_index_text("\"todo_list\"").unwrap();
        assert_eq!(rows, vec![("/p/todo_list.md".to_string(), "ship later".to_string())]);
        assert!(guard.search_index_text("\"it\"").unwrap().is_empty());
    }
}
