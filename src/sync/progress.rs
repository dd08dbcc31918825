//! Progress rendering for file transfers.
//!
//! Thin wrapper over `indicatif` so the uploader can report byte progress
//! without knowing whether anything is attached to the terminal. The hidden
//! mode keeps tests and non-interactive runs silent.

use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};

#[derive(Debug, Clone)]
pub struct ProgressReporter {
    hidden: bool,
}

impl ProgressReporter {
    /// Render bars on stderr.
    pub fn stderr() -> Self {
        Self { hidden: false }
    }

    /// Track progress without drawing anything.
    pub fn hidden() -> Self {
        Self { hidden: true }
    }

    /// Begin tracking one file of `total_bytes`.
    pub fn start(&self, label: &str, total_bytes: u64) -> TransferProgress {
        let bar = if self.hidden {
            ProgressBar::with_draw_target(Some(total_bytes), ProgressDrawTarget::hidden())
        } else {
            ProgressBar::new(total_bytes)
        };
        bar.set_style(transfer_style());
        bar.set_message(label.to_string());
        TransferProgress { bar }
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::stderr()
    }
}

fn transfer_style() -> ProgressStyle {
    ProgressStyle::with_template("{msg} [{bar:30}] {bytes}/{total_bytes} ({bytes_per_sec})")
        .map(|style| style.progress_chars("=> "))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}

/// Handle for one in-flight transfer.
pub struct TransferProgress {
    bar: ProgressBar,
}

impl TransferProgress {
    /// Update with the absolute number of bytes sent so far.
    pub fn advance(&self, bytes_so_far: u64) {
        self.bar.set_position(bytes_so_far);
    }

    pub fn finish(self) {
        self.bar.finish_and_clear();
    }
}
