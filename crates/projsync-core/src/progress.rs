/// Trait for reporting pass progress.
///
/// The CLI implements it with indicatif bars. All methods have default
/// no-op implementations.
pub trait ProgressReporter: Send + Sync {
    fn on_plan_start(&self, _root: &str) {}
    fn on_plan_complete(&self, _actions: usize, _copies: usize, _duration_secs: f64) {}
    fn on_copy_start(&self, _total_files: usize, _total_bytes: u64) {}
    fn on_file_done(&self, _relative: &str, _bytes: u64) {}
    fn on_copy_complete(&self, _files_copied: u64, _duration_secs: f64) {}
    fn on_index_start(&self, _root: &str) {}
    fn on_index_progress(&self, _processed: usize, _total: usize) {}
    fn on_index_complete(&self, _changed: usize, _duration_secs: f64) {}
}

/// No-op progress reporter for silent operation.
pub struct SilentReporter;

impl ProgressReporter for SilentReporter {}
