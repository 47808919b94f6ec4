use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

/// Number of failures already skipped. A single counter shared by every runner of every
/// computation of a processor: `skip_first_failures` bounds the failures skipped by the whole
/// processor.
#[derive(Debug, Default)]
pub struct FailureBudget {
    skipped: AtomicU32,
}

impl FailureBudget {
    /// Consumes one skip, false when `budget` skips were already consumed.
    pub fn try_skip(&self, budget: u32) -> bool {
        self.skipped
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < budget).then_some(n + 1)
            })
            .is_ok()
    }

    pub fn skipped(&self) -> u32 {
        self.skipped.load(Ordering::SeqCst)
    }
}

/// State shared by the runners of one processor.
#[derive(Debug, Default)]
pub struct RunnerShared {
    budget: FailureBudget,
    failed: Mutex<BTreeSet<String>>,
}

impl RunnerShared {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn budget(&self) -> &FailureBudget {
        &self.budget
    }

    pub(crate) fn mark_failed(&self, computation: &str) {
        self.failed.lock().insert(computation.to_string());
    }

    /// Computations with at least one runner terminated on failure.
    pub fn failed(&self) -> Vec<String> {
        self.failed.lock().iter().cloned().collect()
    }
}
