use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::trace;

use crate::error::Error;

/// Files are streamed through the hasher in chunks of this size.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// BLAKE3 digest of a file's full content.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn of_bytes(data: &[u8]) -> Self {
        Self(*blake3::hash(data).as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        blake3::Hash::from(self.0).to_hex().to_string()
    }
}

impl From<blake3::Hash> for ContentHash {
    fn from(hash: blake3::Hash) -> Self {
        Self(*hash.as_bytes())
    }
}

impl FromStr for ContentHash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        blake3::Hash::from_hex(s)
            .map(Self::from)
            .map_err(|e| Error::Other(format!("invalid content hash '{}': {}", s, e)))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", &self.to_hex()[..16])
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Streaming content hasher. Memory use is one chunk regardless of file size.
///
/// Keeps a count of whole-file hash computations so callers (and tests) can
/// observe that unchanged files are not hashed again.
#[derive(Debug, Default)]
pub struct ContentHasher {
    computed: AtomicU64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hash(&self, path: &Path) -> Result<ContentHash, Error> {
        let unreadable = |source: io::Error| Error::SourceUnreadable {
            path: path.to_path_buf(),
            source,
        };
        let mut file = File::open(path).map_err(unreadable)?;
        let digest = hash_reader(&mut file).map_err(unreadable)?;
        self.computed.fetch_add(1, Ordering::Relaxed);
        trace!("Hashed {} -> {}", path.display(), digest);
        Ok(digest)
    }

    pub fn hashes_computed(&self) -> u64 {
        self.computed.load(Ordering::Relaxed)
    }
}

pub fn hash_reader<R: Read>(reader: &mut R) -> io::Result<ContentHash> {
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buffer[..n]);
    }
    Ok(hasher.finalize().into())
}

/// Outcome of a read error vs. a write error while streaming a copy.
#[derive(Debug)]
pub enum CopyError {
    Read(io::Error),
    Write(io::Error),
}

/// Copy `reader` into `writer` chunk by chunk, hashing the bytes as they pass.
/// Returns the digest and the number of bytes copied.
pub fn copy_hashed<R: Read, W: Write>(
    reader: &mut R,
    writer: &mut W,
) -> Result<(ContentHash, u64), CopyError> {
    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = match reader.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(CopyError::Read(e)),
        };
        hasher.update(&buffer[..n]);
        writer.write_all(&buffer[..n]).map_err(CopyError::Write)?;
        total += n as u64;
    }
    Ok((hasher.finalize().into(), total))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn test_identical_bytes_identical_digest() {
        let dir = tempdir().unwrap();
        let a = dir.path().join("a.txt");
        let b = dir.path().join("b.txt");
        fs::write(&a, "hello").unwrap();
        fs::write(&b, "hello").unwrap();

        let hasher = ContentHasher::new();
        assert_eq!(hasher.hash(&a).unwrap(), hasher.hash(&b).unwrap());
        assert_eq!(hasher.hash(&a).unwrap(), ContentHash::of_bytes(b"hello"));
        assert_eq!(hasher.hashes_computed(), 3);
    }

    #[test]
    fn test_large_file_streams_across_chunks() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("big.bin");
        let data: Vec<u8> = (0..(CHUNK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        fs::write(&path, &data).unwrap();

        let hasher = ContentHasher::new();
        assert_eq!(hasher.hash(&path).unwrap(), ContentHash::of_bytes(&data));
    }

    #[test]
    fn test_missing_file_is_source_unreadable() {
        let dir = tempdir().unwrap();
        let hasher = ContentHasher::new();
        let err = hasher.hash(&dir.path().join("gone.txt")).unwrap_err();
        assert!(matches!(err, Error::SourceUnreadable { .. }));
        assert_eq!(hasher.hashes_computed(), 0);
    }

    #[test]
    fn test_hex_parse_and_display_agree() {
        let hash = ContentHash::of_bytes(b"abc");
        let parsed: ContentHash = hash.to_hex().parse().unwrap();
        assert_eq!(parsed, hash);
        assert!("not-hex".parse::<ContentHash>().is_err());
    }

    #[test]
    fn test_copy_hashed_matches_hash() {
        let data = vec![7u8; CHUNK_SIZE + 5];
        let mut out = Vec::new();
        let (digest, n) = copy_hashed(&mut data.as_slice(), &mut out).unwrap();
        assert_eq!(n, data.len() as u64);
        assert_eq!(out, data);
        assert_eq!(digest, ContentHash::of_bytes(&data));
    }
}
