use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, error, info, warn};

use super::plan::{safe_join, FileAction, SyncPlan};
use super::run::{BackupRun, RunTrigger};
use super::SyncEngine;
use crate::cancel::CancellationToken;
use crate::checkpoint::StoreGroup;
use crate::error::Error;
use crate::hasher::{copy_hashed, hash_reader, ContentHash, CopyError, RecordCache};
use crate::progress::ProgressReporter;
use crate::scanner::{relative_key, FileStamp};
use crate::storage::FileRecord;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Suffix of in-flight copies. Not covered by the default excludes, so a
/// partial left by a crash stays visible to orphan cleanup.
pub const PARTIAL_SUFFIX: &str = ".projsync-part";

/// Digest of a freshly written temporary file, compared against the hash
/// taken while copying before the file is renamed into place.
pub trait CopyVerifier: Send + Sync {
    fn digest(&self, written: &Path) -> io::Result<ContentHash>;
}

/// Reads the written file back and hashes it.
#[derive(Debug, Default, Clone, Copy)]
pub struct RehashVerifier;

impl CopyVerifier for RehashVerifier {
    fn digest(&self, written: &Path) -> io::Result<ContentHash> {
        hash_reader(&mut File::open(written)?)
    }
}

/// What a completed copy wrote.
#[derive(Debug, Clone, Copy)]
pub struct CopiedFile {
    pub hash: ContentHash,
    pub bytes: u64,
    /// Source stamp observed when the file was opened.
    pub stamp: FileStamp,
}

impl SyncEngine {
    /// Execute `plan` as a manual run.
    pub fn execute(
        &self,
        plan: &SyncPlan,
        verify: bool,
        cancel: &CancellationToken,
        reporter: &dyn ProgressReporter,
    ) -> BackupRun {
        self.execute_as(RunTrigger::Manual, plan, verify, cancel, reporter)
    }

    pub fn execute_as(
        &self,
        trigger: RunTrigger,
        plan: &SyncPlan,
        verify: bool,
        cancel: &CancellationToken,
        reporter: &dyn ProgressReporter,
    ) -> BackupRun {
        let mut run = BackupRun::new(trigger);
        run.start();
        let start = Instant::now();

        let records = match self.records_for(&plan.record_scope) {
            Ok(records) => records,
            Err(err) => {
                error!("Cannot open records for {}: {}", plan.record_scope, err);
                run.fail(err.to_string());
                return run;
            }
        };

        if let Err(source) = fs::create_dir_all(&plan.destination_root) {
            let err = Error::DestinationWriteFailed {
                path: plan.destination_root.clone(),
                source,
            };
            error!("{}", err);
            run.fail(err.to_string());
            return run;
        }

        let copy_dirs: BTreeSet<PathBuf> = plan
            .copies()
            .filter_map(|action| safe_join(&plan.destination_root, action.relative()).ok())
            .filter_map(|dst| dst.parent().map(Path::to_path_buf))
            .collect();
        for dir in &copy_dirs {
            sweep_partials(dir);
        }

        for relative in &plan.rejected {
            run.record_failure(
                relative.as_str(),
                &Error::PathTraversalRejected {
                    path: PathBuf::from(relative),
                },
            );
        }

        reporter.on_copy_start(plan.copies().count(), plan.copy_bytes());

        for action in &plan.actions {
            if cancel.is_cancelled() {
                warn!(
                    "Backup cancelled after {} copies; remaining actions not attempted",
                    run.files_copied()
                );
                run.fail(Error::Cancelled.to_string());
                return run;
            }

            match action {
                FileAction::Skip { refresh, .. } => {
                    if let Some(record) = refresh {
                        store_record(&records, record.clone());
                    }
                    run.record_skip();
                }
                FileAction::Delete { relative, .. } => {
                    match delete_action(&records, &plan.destination_root, relative) {
                        Ok(()) => run.record_delete(),
                        Err(err) => {
                            if abort_on(&mut run, relative, err) {
                                return run;
                            }
                        }
                    }
                }
                FileAction::Copy {
                    relative,
                    src,
                    group,
                    ..
                } => match self.copy_action(&records, plan, relative, src, group.as_ref(), verify) {
                    Ok(copied) => {
                        run.record_copy(copied.bytes);
                        reporter.on_file_done(relative, copied.bytes);
                    }
                    Err(err) => {
                        if abort_on(&mut run, relative, err) {
                            return run;
                        }
                    }
                },
            }
        }

        run.complete();
        reporter.on_copy_complete(run.files_copied(), start.elapsed().as_secs_f64());
        info!("{}", run);
        run
    }

    fn copy_action(
        &self,
        records: &RecordCache,
        plan: &SyncPlan,
        relative: &str,
        src: &Path,
        group: Option<&StoreGroup>,
        verify: bool,
    ) -> Result<CopiedFile, Error> {
        // Re-validated at execution: plans can be built elsewhere.
        let dst = safe_join(&plan.destination_root, relative)?;

        if let Some(group) = group {
            self.checkpointer.checkpoint(group)?;
        }

        let verifier = verify.then(|| &*self.verifier);
        let copied = copy_atomic(src, &dst, verifier)?;
        store_record(records, FileRecord::new(relative, copied.stamp, Some(copied.hash)));

        if let Some(group) = group {
            // Sidecars are recorded as they look after the checkpoint.
            for sidecar in group.sidecars() {
                let key = match sidecar.strip_prefix(&plan.source_root) {
                    Ok(rel) => relative_key(rel),
                    Err(_) => continue,
                };
                match FileStamp::of(sidecar) {
                    Ok(stamp) => store_record(records, FileRecord::new(key, stamp, None)),
                    Err(err) if err.kind() == io::ErrorKind::NotFound => {
                        let _ = records.remove(&key);
                    }
                    Err(err) => debug!("Cannot stat sidecar {}: {}", sidecar.display(), err),
                }
            }
        }

        debug!("Copied {} ({} bytes)", relative, copied.bytes);
        Ok(copied)
    }

}

fn delete_action(records: &RecordCache, destination_root: &Path, relative: &str) -> Result<(), Error> {
    let dst = safe_join(destination_root, relative)?;
    match fs::remove_file(&dst) {
        Ok(()) => debug!("Deleted {}", dst.display()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(source) => return Err(Error::DestinationWriteFailed { path: dst, source }),
    }
    if let Err(err) = records.remove(relative) {
        warn!("Failed to drop record for {}: {}", relative, err);
    }
    Ok(())
}

fn store_record(records: &RecordCache, record: FileRecord) {
    let path = record.path.clone();
    if let Err(err) = records.put(record) {
        // The copy stands; a missing record only costs a re-copy next pass.
        warn!("Failed to persist record for {}: {}", path, err);
    }
}

/// Record `err` against `relative`; returns true if the pass must stop.
fn abort_on(run: &mut BackupRun, relative: &str, err: Error) -> bool {
    run.record_failure(relative, &err);
    if err.is_systemic() {
        error!("Aborting pass: {}", err);
        run.fail(err.to_string());
        true
    } else {
        warn!("{}: {}", relative, err);
        false
    }
}

/// Copy `src` over `dst` so that `dst` either keeps its prior content or holds
/// the complete new content: write a temporary sibling, fsync it, check it
/// with `verifier` if given, then rename it into place.
pub fn copy_atomic(
    src: &Path,
    dst: &Path,
    verifier: Option<&dyn CopyVerifier>,
) -> Result<CopiedFile, Error> {
    let unreadable = |source: io::Error| Error::SourceUnreadable {
        path: src.to_path_buf(),
        source,
    };

    let mut reader = File::open(src).map_err(unreadable)?;
    let metadata = reader.metadata().map_err(unreadable)?;
    let stamp = FileStamp::from_metadata(&metadata);

    let parent = dst.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(|source| Error::DestinationWriteFailed {
        path: parent.to_path_buf(),
        source,
    })?;

    let tmp = temp_sibling(dst);
    let write_failed = |source: io::Error| Error::DestinationWriteFailed {
        path: tmp.clone(),
        source,
    };

    let result = (|| -> Result<CopiedFile, Error> {
        let mut writer = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&tmp)
            .map_err(write_failed)?;
        let (hash, bytes) = copy_hashed(&mut reader, &mut writer).map_err(|e| match e {
            CopyError::Read(source) => unreadable(source),
            CopyError::Write(source) => write_failed(source),
        })?;
        writer.sync_all().map_err(write_failed)?;
        if let Ok(modified) = metadata.modified() {
            writer.set_modified(modified).map_err(write_failed)?;
        }
        drop(writer);

        if let Some(verifier) = verifier {
            let actual = verifier.digest(&tmp).map_err(write_failed)?;
            if actual != hash {
                return Err(Error::HashMismatchAfterCopy {
                    path: dst.to_path_buf(),
                    expected: hash.to_hex(),
                    actual: actual.to_hex(),
                });
            }
        }

        fs::rename(&tmp, dst).map_err(|source| Error::DestinationWriteFailed {
            path: dst.to_path_buf(),
            source,
        })?;
        Ok(CopiedFile { hash, bytes, stamp })
    })();

    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn temp_sibling(dst: &Path) -> PathBuf {
    let name = dst
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let n = TEMP_COUNTER.fetch_add(1, Ordering::Relaxed);
    dst.with_file_name(format!(".{}.{}-{}{}", name, process::id(), n, PARTIAL_SUFFIX))
}

/// Id of the process that wrote a partial copy named by `temp_sibling`.
fn partial_owner(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(PARTIAL_SUFFIX)?;
    let (_, tag) = stem.rsplit_once('.')?;
    let (pid, _) = tag.split_once('-')?;
    pid.parse().ok()
}

/// Remove partial copies in `dir` left behind by other processes.
fn sweep_partials(dir: &Path) {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return,
    };
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        match partial_owner(&name) {
            Some(pid) if pid != process::id() => {}
            _ => continue,
        }
        match fs::remove_file(entry.path()) {
            Ok(()) => info!("Removed stale partial copy {}", entry.path().display()),
            Err(err) => warn!("Cannot remove partial copy {}: {}", entry.path().display(), err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_copy_atomic_preserves_content_and_mtime() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("src.txt");
        let dst = dir.path().join("out/nested/dst.txt");
        fs::write(&src, "payload").unwrap();

        let copied = copy_atomic(&src, &dst, Some(&RehashVerifier)).unwrap();
        assert_eq!(fs::read_to_string(&dst).unwrap(), "payload");
        assert_eq!(copied.hash, ContentHash::of_bytes(b"payload"));
        assert_eq!(copied.bytes, 7);
        assert_eq!(
            FileStamp::of(&dst).unwrap().modified,
            FileStamp::of(&src).unwrap().modified
        );
    }

    #[test]
    fn test_copy_atomic_leaves_no_temp_files() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a.txt");
        fs::write(&src, "x").unwrap();
        let out = dir.path().join("out");
        copy_atomic(&src, &out.join("a.txt"), None).unwrap();
        let names: Vec<String> = fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["a.txt".to_string()]);
    }

    #[test]
    fn test_missing_source_leaves_destination_untouched() {
        let dir = tempdir().unwrap();
        let dst = dir.path().join("dst.txt");
        fs::write(&dst, "previous").unwrap();
        let err = copy_atomic(&dir.path().join("gone.txt"), &dst, Some(&RehashVerifier)).unwrap_err();
        assert!(matches!(err, Error::SourceUnreadable { .. }));
        assert_eq!(fs::read_to_string(&dst).unwrap(), "previous");
    }

    #[test]
    fn test_blocked_parent_is_destination_failure() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("a.txt");
        fs::write(&src, "x").unwrap();
        fs::write(dir.path().join("blocker"), "file, not dir").unwrap();
        let err = copy_atomic(&src, &dir.path().join("blocker/a.txt"), None).unwrap_err();
        assert!(err.is_systemic());
    }

    #[test]
    fn test_partial_names_carry_owner() {
        let tmp = temp_sibling(Path::new("/d/notes.v2.md"));
        let name = tmp.file_name().unwrap().to_string_lossy().into_owned();
        assert!(name.starts_with(".notes.v2.md."));
        assert!(name.ends_with(PARTIAL_SUFFIX));
        assert_eq!(partial_owner(&name), Some(process::id()));
        assert_eq!(partial_owner("notes.md"), None);
        assert_eq!(partial_owner(".a.txt.x-1.projsync-part"), None);
    }

    #[test]
    fn test_sweep_keeps_own_partials_and_other_files() {
        let dir = tempdir().unwrap();
        let foreign = format!(".a.txt.{}-0{}", process::id().wrapping_add(1), PARTIAL_SUFFIX);
        let own = format!(".b.txt.{}-0{}", process::id(), PARTIAL_SUFFIX);
        fs::write(dir.path().join(&foreign), "torn").unwrap();
        fs::write(dir.path().join(&own), "in flight").unwrap();
        fs::write(dir.path().join("a.txt"), "kept").unwrap();

        sweep_partials(dir.path());
        assert!(!dir.path().join(&foreign).exists());
        assert!(dir.path().join(&own).exists());
        assert!(dir.path().join("a.txt").exists());
    }
}
