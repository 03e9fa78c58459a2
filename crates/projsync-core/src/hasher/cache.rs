use dashmap::DashMap;
use std::path::Path;
use tracing::{debug, trace};

use super::{ContentHash, ContentHasher};
use crate::error::Error;
use crate::scanner::FileStamp;
use crate::storage::{lock_shared, FileRecord, SharedDatabase};

/// FileRecords for one scope, kept in memory and written through to storage.
///
/// The cache never decides *when* a record changes; callers update it after
/// the work the record vouches for (a copy, an index write) has succeeded.
pub struct RecordCache {
    scope: String,
    records: DashMap<String, FileRecord>,
    db: Option<SharedDatabase>,
}

impl RecordCache {
    pub fn in_memory(scope: impl Into<String>) -> Self {
        Self {
            scope: scope.into(),
            records: DashMap::new(),
            db: None,
        }
    }

    pub fn load(scope: impl Into<String>, db: SharedDatabase) -> Result<Self, Error> {
        let scope = scope.into();
        let records = DashMap::new();
        {
            let guard = lock_shared(&db)?;
            for record in guard.load_file_records(&scope)? {
                records.insert(record.path.clone(), record);
            }
        }
        debug!("Record cache '{}' loaded {} records", scope, records.len());
        Ok(Self {
            scope,
            records,
            db: Some(db),
        })
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }

    pub fn get(&self, path: &str) -> Option<FileRecord> {
        self.records.get(path).map(|r| r.value().clone())
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.records.iter().map(|r| r.key().clone()).collect();
        paths.sort();
        paths
    }

    /// Content hash for `path`, reusing the recorded hash when the stamp is
    /// unchanged and hashing the file otherwise. Does not modify the record.
    pub fn content_hash(
        &self,
        hasher: &ContentHasher,
        path: &str,
        file: &Path,
        stamp: FileStamp,
    ) -> Result<ContentHash, Error> {
        if let Some(record) = self.records.get(path) {
            if record.matches(stamp) {
                if let Some(hash) = record.content_hash {
                    trace!("Found hash for {} in record cache", path);
                    return Ok(hash);
                }
            }
        }
        trace!("No usable record for {}, hashing", path);
        hasher.hash(file)
    }

    pub fn put(&self, record: FileRecord) -> Result<(), Error> {
        if let Some(db) = &self.db {
            let guard = lock_shared(db)?;
            guard.upsert_file_record(&self.scope, &record)?;
        }
        self.records.insert(record.path.clone(), record);
        Ok(())
    }

    pub fn remove(&self, path: &str) -> Result<bool, Error> {
        if let Some(db) = &self.db {
            let guard = lock_shared(db)?;
            guard.delete_file_record(&self.scope, path)?;
        }
        Ok(self.records.remove(path).is_some())
    }
}
