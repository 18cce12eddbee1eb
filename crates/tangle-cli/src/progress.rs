//! Terminal progress bar implementation.

use indicatif::{ProgressBar, ProgressStyle};
use tangle_core::Progress;

/// A terminal progress bar whose total grows as work is discovered.
#[derive(Debug)]
pub struct TerminalProgress {
    bar: ProgressBar,
}

impl TerminalProgress {
    /// Create a bar with the given message.
    #[must_use]
    pub fn new(message: &'static str) -> Self {
        let bar = ProgressBar::new(0);
        bar.set_style(
            ProgressStyle::with_template("{msg} [{bar:30}] {pos}/{len} {per_sec}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=> "),
        );
        bar.set_message(message);
        Self { bar }
    }
}

impl Progress for TerminalProgress {
    fn add_total(&self, n: u64) {
        self.bar.inc_length(n);
    }

    fn inc(&self, n: u64) {
        self.bar.inc(n);
    }

    fn finish(&self) {
        self.bar.finish_and_clear();
    }
}
