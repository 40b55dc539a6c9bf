//! C6 — live progress reporting across all worker threads, one bar per
//! partition rendered under a shared `MultiProgress`.

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use size::Size;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowState {
    Pending,
    InProgress,
    Done,
}

/// One partition's row in the rendered progress display.
pub struct ProgressRow {
    bar: ProgressBar,
    state: RowState,
}

impl ProgressRow {
    fn new(bar: ProgressBar) -> Self {
        Self {
            bar,
            state: RowState::Pending,
        }
    }

    pub fn start(&mut self, total_operations: u64) {
        self.state = RowState::InProgress;
        self.bar.set_length(total_operations);
        self.bar.set_position(0);
    }

    pub fn set_operation(&mut self, index: u64, op_name: &str) {
        self.bar.set_position(index);
        self.bar.set_message(op_name.to_string());
    }

    pub fn finish(&mut self) {
        self.state = RowState::Done;
        self.bar.finish_with_message("done");
    }

    pub fn abandon(&mut self, reason: &str) {
        self.state = RowState::Done;
        self.bar.abandon_with_message(reason.to_string());
    }

    pub fn state(&self) -> RowState {
        self.state
    }
}

/// Owns one row per partition and the `MultiProgress` they're rendered
/// under. Created once per extraction run; workers hold a shared reference
/// and index into it by partition name.
pub struct ProgressReporter {
    multi: MultiProgress,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
        }
    }

    /// Adds a row for `partition_name` sized `partition_bytes`, labeled with
    /// its human-readable size the way the original payload dumper's
    /// terminal output did.
    pub fn add_row(&self, partition_name: &str, partition_bytes: u64) -> ProgressRow {
        let style = ProgressStyle::default_bar()
            .template("{prefix:.bold} [{elapsed_precise}] {bar:30.cyan/blue} {pos:>5}/{len:5} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar());

        let bar = self.multi.add(ProgressBar::new(0));
        bar.set_style(style);
        bar.set_prefix(format!(
            "{:<20} ({})",
            partition_name,
            Size::from_bytes(partition_bytes)
        ));

        ProgressRow::new(bar)
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}
