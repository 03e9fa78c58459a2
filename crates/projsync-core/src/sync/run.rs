use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

use crate::error::{Error, FailureKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Completed | RunStatus::Failed)
    }

    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Pending, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        }
    }

    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "pending" => RunStatus::Pending,
            "running" => RunStatus::Running,
            "completed" => RunStatus::Completed,
            _ => RunStatus::Failed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunTrigger {
    Scheduled,
    Manual,
}

impl RunTrigger {
    pub fn as_str(self) -> &'static str {
        match self {
            RunTrigger::Scheduled => "scheduled",
            RunTrigger::Manual => "manual",
        }
    }

    pub(crate) fn parse(s: &str) -> Self {
        match s {
            "scheduled" => RunTrigger::Scheduled,
            _ => RunTrigger::Manual,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileFailure {
    pub path: String,
    pub kind: FailureKind,
    pub message: String,
}

/// One executed synchronization pass and its outcome.
///
/// Counters and the failure list only grow, and only while the run is
/// `Running`; once a terminal status is reached the run is frozen.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupRun {
    pub(crate) id: Option<i64>,
    pub(crate) trigger: RunTrigger,
    pub(crate) started_at: DateTime<Utc>,
    pub(crate) finished_at: Option<DateTime<Utc>>,
    pub(crate) status: RunStatus,
    pub(crate) files_copied: u64,
    pub(crate) bytes_copied: u64,
    pub(crate) files_skipped: u64,
    pub(crate) files_deleted: u64,
    pub(crate) failures: Vec<FileFailure>,
    pub(crate) abort_reason: Option<String>,
}

impl BackupRun {
    pub fn new(trigger: RunTrigger) -> Self {
        Self {
            id: None,
            trigger,
            started_at: Utc::now(),
            finished_at: None,
            status: RunStatus::Pending,
            files_copied: 0,
            bytes_copied: 0,
            files_skipped: 0,
            files_deleted: 0,
            failures: Vec::new(),
            abort_reason: None,
        }
    }

    fn transition(&mut self, next: RunStatus) -> bool {
        if !self.status.can_transition_to(next) {
            warn!(
                "Refusing backup run transition {} -> {}",
                self.status.as_str(),
                next.as_str()
            );
            return false;
        }
        self.status = next;
        true
    }

    fn accepting(&self) -> bool {
        if self.status != RunStatus::Running {
            warn!("Ignoring update to backup run in state {}", self.status.as_str());
            return false;
        }
        true
    }

    pub fn start(&mut self) -> bool {
        let started = self.transition(RunStatus::Running);
        if started {
            self.started_at = Utc::now();
        }
        started
    }

    pub fn complete(&mut self) -> bool {
        let done = self.transition(RunStatus::Completed);
        if done {
            self.finished_at = Some(Utc::now());
        }
        done
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> bool {
        let done = self.transition(RunStatus::Failed);
        if done {
            self.finished_at = Some(Utc::now());
            self.abort_reason = Some(reason.into());
        }
        done
    }

    pub fn record_copy(&mut self, bytes: u64) {
        if self.accepting() {
            self.files_copied += 1;
            self.bytes_copied += bytes;
        }
    }

    pub fn record_skip(&mut self) {
        if self.accepting() {
            self.files_skipped += 1;
        }
    }

    pub fn record_delete(&mut self) {
        if self.accepting() {
            self.files_deleted += 1;
        }
    }

    pub fn record_failure(&mut self, path: impl Into<String>, error: &Error) {
        if !self.accepting() {
            return;
        }
        let kind = match error.kind() {
            Some(kind) => kind,
            None => {
                warn!("Unclassified error recorded as SourceUnreadable: {}", error);
                FailureKind::SourceUnreadable
            }
        };
        self.failures.push(FileFailure {
            path: path.into(),
            kind,
            message: error.to_string(),
        });
    }

    pub fn id(&self) -> Option<i64> {
        self.id
    }

    pub(crate) fn set_id(&mut self, id: i64) {
        self.id = Some(id);
    }

    pub fn trigger(&self) -> RunTrigger {
        self.trigger
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn finished_at(&self) -> Option<DateTime<Utc>> {
        self.finished_at
    }

    pub fn status(&self) -> RunStatus {
        self.status
    }

    pub fn files_copied(&self) -> u64 {
        self.files_copied
    }

    pub fn bytes_copied(&self) -> u64 {
        self.bytes_copied
    }

    pub fn files_skipped(&self) -> u64 {
        self.files_skipped
    }

    pub fn files_deleted(&self) -> u64 {
        self.files_deleted
    }

    pub fn failures(&self) -> &[FileFailure] {
        &self.failures
    }

    pub fn abort_reason(&self) -> Option<&str> {
        self.abort_reason.as_deref()
    }

    /// Completed with no per-file failures.
    pub fn is_clean(&self) -> bool {
        self.status == RunStatus::Completed && self.failures.is_empty()
    }

    pub fn duration(&self) -> Option<chrono::Duration> {
        self.finished_at.map(|end| end - self.started_at)
    }

    /// Counts line followed by one line per failure (path and kind).
    pub fn summary(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for BackupRun {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {} run: {} copied ({} bytes), {} skipped, {} deleted, {} failed",
            self.status.as_str(),
            self.trigger.as_str(),
            self.files_copied,
            self.bytes_copied,
            self.files_skipped,
            self.files_deleted,
            self.failures.len()
        )?;
        if let Some(reason) = &self.abort_reason {
            write!(f, " (aborted: {})", reason)?;
        }
        for failure in &self.failures {
            write!(f, "\n  {} [{}] {}", failure.path, failure.kind, failure.message)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_lifecycle_pending_running_completed() {
        let mut run = BackupRun::new(RunTrigger::Manual);
        assert_eq!(run.status(), RunStatus::Pending);
        assert!(run.start());
        run.record_copy(10);
        run.record_skip();
        assert!(run.complete());
        assert_eq!(run.status(), RunStatus::Completed);
        assert_eq!(run.files_copied(), 1);
        assert_eq!(run.bytes_copied(), 10);
        assert!(run.finished_at().is_some());
        assert!(run.is_clean());
    }

    #[test]
    fn test_terminal_status_is_never_reentered() {
        let mut run = BackupRun::new(RunTrigger::Scheduled);
        run.start();
        run.fail("destination unreachable");
        assert!(!run.start());
        assert!(!run.complete());
        assert_eq!(run.status(), RunStatus::Failed);
        assert_eq!(run.abort_reason(), Some("destination unreachable"));
    }

    #[test]
    fn test_updates_ignored_once_terminal() {
        let mut run = BackupRun::new(RunTrigger::Manual);
        run.start();
        run.complete();
        run.record_copy(100);
        run.record_failure(
            "a.txt",
            &Error::PathTraversalRejected {
                path: PathBuf::from("../a.txt"),
            },
        );
        assert_eq!(run.files_copied(), 0);
        assert!(run.failures().is_empty());
    }

    #[test]
    fn test_pending_cannot_complete_directly() {
        let mut run = BackupRun::new(RunTrigger::Manual);
        assert!(!run.complete());
        assert_eq!(run.status(), RunStatus::Pending);
    }

    #[test]
    fn test_failure_kind_and_summary() {
        let mut run = BackupRun::new(RunTrigger::Manual);
        run.start();
        run.record_failure(
            "b.txt",
            &Error::HashMismatchAfterCopy {
                path: PathBuf::from("b.txt"),
                expected: "aa".into(),
                actual: "bb".into(),
            },
        );
        run.complete();
        assert_eq!(run.failures()[0].kind, FailureKind::HashMismatchAfterCopy);
        assert!(!run.is_clean());
        let summary = run.to_string();
        assert!(summary.contains("1 failed"));
        assert!(summary.contains("HashMismatchAfterCopy"));
    }
}
