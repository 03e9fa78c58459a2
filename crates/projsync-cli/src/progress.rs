use indicatif::{ProgressBar, ProgressStyle};
use projsync_core::ProgressReporter;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

const TICK_CHARS: &str = "⠋⠙⠹⠸⠼⠴⠦⠧⠇⠏";

/// CLI progress reporter using indicatif progress bars.
///
/// - Plan phase: spinner
/// - Copy phase: byte bar (total known from the plan)
/// - Index phase: file bar
pub struct CliReporter {
    bar: Mutex<Option<ProgressBar>>,
}

impl CliReporter {
    pub fn new() -> Self {
        Self {
            bar: Mutex::new(None),
        }
    }

    fn guard(&self) -> MutexGuard<'_, Option<ProgressBar>> {
        match self.bar.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_bar(&self, pb: ProgressBar) {
        let mut guard = self.guard();
        if let Some(old) = guard.take() {
            old.finish_and_clear();
        }
        *guard = Some(pb);
    }

    fn finish_bar(&self) {
        if let Some(pb) = self.guard().take() {
            pb.finish_and_clear();
        }
    }

    fn spinner(&self, message: String) {
        let pb = ProgressBar::new_spinner();
        pb.set_style(
            ProgressStyle::with_template("{spinner:.cyan} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner())
                .tick_chars(TICK_CHARS),
        );
        pb.set_message(message);
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }

    fn bar(&self, len: u64, template: &str) {
        let pb = ProgressBar::new(len);
        pb.set_style(
            ProgressStyle::with_template(template)
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("━╸─")
                .tick_chars(TICK_CHARS),
        );
        pb.enable_steady_tick(Duration::from_millis(80));
        self.set_bar(pb);
    }
}

impl Default for CliReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for CliReporter {
    fn on_plan_start(&self, root: &str) {
        self.spinner(format!("Comparing {} with the last backup...", root));
    }

    fn on_plan_complete(&self, actions: usize, copies: usize, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m Plan complete: {} files, {} to copy in {:.2}s",
            actions, copies, duration_secs
        );
    }

    fn on_copy_start(&self, total_files: usize, total_bytes: u64) {
        if total_files == 0 {
            return;
        }
        self.bar(
            total_bytes,
            "  {spinner:.cyan} Copying [{bar:30.cyan/dim}] {bytes}/{total_bytes} {msg}",
        );
    }

    fn on_file_done(&self, relative: &str, bytes: u64) {
        if let Some(pb) = self.guard().as_ref() {
            pb.inc(bytes);
            pb.set_message(relative.to_string());
        }
    }

    fn on_copy_complete(&self, files_copied: u64, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m Copy complete: {} files in {:.2}s",
            files_copied, duration_secs
        );
    }

    fn on_index_start(&self, root: &str) {
        self.bar(
            0,
            "  {spinner:.cyan} Indexing [{bar:30.cyan/dim}] {pos}/{len} files ({eta} remaining)",
        );
        if let Some(pb) = self.guard().as_ref() {
            pb.set_message(root.to_string());
        }
    }

    fn on_index_progress(&self, processed: usize, total: usize) {
        if let Some(pb) = self.guard().as_ref() {
            if pb.length() != Some(total as u64) {
                pb.set_length(total as u64);
            }
            pb.set_position(processed as u64);
        }
    }

    fn on_index_complete(&self, changed: usize, duration_secs: f64) {
        self.finish_bar();
        eprintln!(
            "  \x1b[32m✓\x1b[0m Index complete: {} entries changed in {:.2}s",
            changed, duration_secs
        );
    }
}
