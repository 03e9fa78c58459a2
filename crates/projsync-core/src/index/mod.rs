mod content_index;
mod tokenize;
mod updater;

pub use content_index::ContentIndex;
pub use tokenize::{term_frequencies, tokenize};
pub use updater::{IndexMutation, IndexUpdater, ReconcileSummary};
pub(crate) use updater::absolute_root;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::hasher::ContentHash;

/// One indexed file, keyed by its absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub path: String,
    pub content_hash: ContentHash,
    pub size: u64,
    pub preview: String,
    pub last_indexed: DateTime<Utc>,
}

/// Paths currently sharing one content hash (always two or more).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DuplicateGroup {
    pub content_hash: ContentHash,
    pub paths: Vec<String>,
}

impl DuplicateGroup {
    /// Bytes that would be freed by keeping a single copy.
    pub fn wasted_bytes(&self, size: u64) -> u64 {
        size * (self.paths.len() as u64).saturating_sub(1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchHit {
    pub entry: IndexEntry,
    pub score: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub file_count: usize,
    pub total_bytes: u64,
    pub duplicate_groups: usize,
    /// Lowercased extension (empty for none) to file count.
    pub by_extension: BTreeMap<String, usize>,
    pub last_indexed: Option<DateTime<Utc>>,
}
