use dashmap::DashMap;
use rayon::prelude::*;
use std::fs::{self, Metadata};
use std::io;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, error};

use crate::matcher::PathMatcher;

/// Size and modification time: the cheap change-detection key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileStamp {
    pub size: u64,
    /// Nanoseconds since the Unix epoch (0 if the platform cannot tell).
    pub modified: i64,
}

impl FileStamp {
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let modified = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as i64)
            .unwrap_or(0);
        Self {
            size: metadata.len(),
            modified,
        }
    }

    pub fn of(path: &Path) -> io::Result<Self> {
        fs::metadata(path).map(|m| Self::from_metadata(&m))
    }
}

/// A regular file found under a scan root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScannedFile {
    /// Root-relative path with `/` separators; the identity used in plans and records.
    pub relative: String,
    pub absolute: PathBuf,
    pub stamp: FileStamp,
}

/// Parallel directory traversal. Returns every regular file under `root`
/// that is not excluded by `matcher`, sorted by relative path.
/// Excluded directories are pruned; symlinks are skipped.
pub fn scan_tree(root: &Path, matcher: &PathMatcher) -> io::Result<Vec<ScannedFile>> {
    let root_meta = fs::metadata(root).map_err(|e| {
        io::Error::new(e.kind(), format!("Cannot read root {}: {}", root.display(), e))
    })?;
    if !root_meta.is_dir() {
        return Err(io::Error::new(
            io::ErrorKind::NotFound,
            format!("Root {} is not a directory", root.display()),
        ));
    }

    let found: DashMap<String, ScannedFile> = DashMap::new();
    visit_dirs(root, root, &found, matcher)?;

    let mut files: Vec<ScannedFile> = found.into_iter().map(|(_, f)| f).collect();
    files.sort_by(|a, b| a.relative.cmp(&b.relative));
    debug!("Scanned {} files under {}", files.len(), root.display());
    Ok(files)
}

fn visit_dirs(
    root: &Path,
    dir: &Path,
    found: &DashMap<String, ScannedFile>,
    matcher: &PathMatcher,
) -> io::Result<()> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(err) => {
            if err.kind() == io::ErrorKind::PermissionDenied {
                error!(
                    "Access denied reading directory {}: {}",
                    dir.display(),
                    err
                );
                return Ok(());
            } else if err.kind() == io::ErrorKind::NotFound && dir != root {
                debug!("Directory vanished during scan: {}", dir.display());
                return Ok(());
            } else {
                return Err(io::Error::new(
                    err.kind(),
                    format!("Error reading directory {}: {}", dir.display(), err),
                ));
            }
        }
    };

    entries.par_bridge().try_for_each(|entry_result| {
        let entry = match entry_result {
            Ok(entry) => entry,
            Err(err) => {
                return Err(io::Error::new(
                    err.kind(),
                    format!(
                        "Error reading entry in directory {}: {}",
                        dir.display(),
                        err
                    ),
                ));
            }
        };

        let path = entry.path();
        let relative = match path.strip_prefix(root) {
            Ok(rel) => rel,
            Err(_) => return Ok(()),
        };
        if matcher.matches(relative) {
            return Ok(());
        }

        // A live tree: entries may disappear between read_dir and stat.
        let metadata = match fs::symlink_metadata(&path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => {
                return Err(io::Error::new(
                    err.kind(),
                    format!(
                        "Error getting metadata for {}: {}",
                        path.display(),
                        err
                    ),
                ));
            }
        };

        let file_type = metadata.file_type();
        if file_type.is_dir() {
            visit_dirs(root, &path, found, matcher)?;
        } else if file_type.is_file() {
            let key = relative_key(relative);
            found.insert(
                key.clone(),
                ScannedFile {
                    relative: key,
                    absolute: path.clone(),
                    stamp: FileStamp::from_metadata(&metadata),
                },
            );
        }
        Ok(())
    })?;

    Ok(())
}

/// `/`-joined normal components of a relative path.
pub fn relative_key(relative: &Path) -> String {
    relative
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
