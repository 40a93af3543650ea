use std::sync::atomic::{AtomicU64, Ordering};

/// Timeout and error tallies for one collection cycle.
///
/// A fresh instance is created per cycle and shared with every worker of
/// that cycle.
#[derive(Debug, Default)]
pub struct ScrapeStats {
    timeouts: AtomicU64,
    errors: AtomicU64,
}

impl ScrapeStats {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    /// A timeout is also an error.
    pub fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
        self.record_error();
    }

    #[must_use]
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::Relaxed)
    }
}
