pub mod cache;
mod content;

pub use cache::RecordCache;
pub use content::{copy_hashed, hash_reader, ContentHash, ContentHasher, CopyError, CHUNK_SIZE};
