//! Progress reporting behind a trait, so tests can run silently.

/// Reports resolution progress to the user.
///
/// The engine and the enrichers call this as work is discovered and
/// completed; the CLI plugs in a terminal progress bar, tests plug in
/// [`SilentProgress`].
pub trait Progress: Send + Sync {
    /// Grow the expected amount of work by `n` items.
    fn add_total(&self, n: u64);

    /// Record `n` items of completed work.
    fn inc(&self, n: u64);

    /// All work is done; tear down any display.
    fn finish(&self) {}
}

/// A progress reporter that reports nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct SilentProgress;

impl Progress for SilentProgress {
    fn add_total(&self, _n: u64) {}

    fn inc(&self, _n: u64) {}
}
