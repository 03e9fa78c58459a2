use serde::{Deserialize, Serialize};

use crate::hasher::ContentHash;
use crate::scanner::FileStamp;

/// Last observed state of one file within a scope (a sync pair or the index).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: String,
    pub size: u64,
    /// Modification time, nanoseconds since the Unix epoch.
    pub modified: i64,
    pub content_hash: Option<ContentHash>,
    pub indexed: bool,
}

impl FileRecord {
    pub fn new(path: impl Into<String>, stamp: FileStamp, content_hash: Option<ContentHash>) -> Self {
        Self {
            path: path.into(),
            size: stamp.size,
            modified: stamp.modified,
            content_hash,
            indexed: false,
        }
    }

    pub fn stamp(&self) -> FileStamp {
        FileStamp {
            size: self.size,
            modified: self.modified,
        }
    }

    /// Cheap negative check: same size and mtime means the content is assumed unchanged.
    pub fn matches(&self, stamp: FileStamp) -> bool {
        self.stamp() == stamp
    }
}
