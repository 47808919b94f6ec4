//! Error injection for the in-memory log, used to exercise the failure paths of the runners.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Fails the next N operations of a kind. Counters are independent from each other.
#[derive(Debug, Default)]
pub struct ErrorInjector {
    fail_next_appends: AtomicUsize,
    fail_next_reads: AtomicUsize,
    fail_next_commits: AtomicUsize,
}

impl ErrorInjector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_appends(&self, count: usize) {
        self.fail_next_appends.store(count, Ordering::Relaxed);
    }

    pub fn fail_reads(&self, count: usize) {
        self.fail_next_reads.store(count, Ordering::Relaxed);
    }

    pub fn fail_commits(&self, count: usize) {
        self.fail_next_commits.store(count, Ordering::Relaxed);
    }

    pub(crate) fn should_fail_append(&self) -> bool {
        Self::decrement_counter(&self.fail_next_appends)
    }

    pub(crate) fn should_fail_read(&self) -> bool {
        Self::decrement_counter(&self.fail_next_reads)
    }

    pub(crate) fn should_fail_commit(&self) -> bool {
        Self::decrement_counter(&self.fail_next_commits)
    }

    /// Returns true if the counter was positive, decrementing it.
    fn decrement_counter(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_sub(1))
            .is_ok()
    }
}
