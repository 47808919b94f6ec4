use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use backoff::policy::RetryPolicy;

use crate::Error;

const DEFAULT_BATCH_CAPACITY: usize = 1;
const DEFAULT_BATCH_THRESHOLD: Duration = Duration::from_secs(1);

/// Decides whether a failure of a computation is worth retrying.
pub type RetryPredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// How a computation reacts to failures and how its records are batched.
///
/// The default policy never retries and terminates the computation on the first failure.
#[derive(Clone)]
pub struct ComputationPolicy {
    retry_policy: RetryPolicy,
    retry_on: Option<RetryPredicate>,
    continue_on_failure: bool,
    skip_first_failures: u32,
    batch_capacity: usize,
    batch_threshold: Duration,
}

impl Default for ComputationPolicy {
    fn default() -> Self {
        Self {
            retry_policy: RetryPolicy::no_retry(),
            retry_on: None,
            continue_on_failure: false,
            skip_first_failures: 0,
            batch_capacity: DEFAULT_BATCH_CAPACITY,
            batch_threshold: DEFAULT_BATCH_THRESHOLD,
        }
    }
}

impl ComputationPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Restricts the retries to the failures matching the predicate.
    pub fn with_retry_on<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&Error) -> bool + Send + Sync + 'static,
    {
        self.retry_on = Some(Arc::new(predicate));
        self
    }

    /// Skip the failing record and keep going once the retries are exhausted.
    pub fn with_continue_on_failure(mut self, continue_on_failure: bool) -> Self {
        self.continue_on_failure = continue_on_failure;
        self
    }

    /// Skip the first `count` failures, then terminate on the next one. The count is shared by
    /// every computation of the processor.
    pub fn with_skip_first_failures(mut self, count: u32) -> Self {
        self.skip_first_failures = count;
        self
    }

    pub fn with_batch_policy(mut self, capacity: usize, threshold: Duration) -> Self {
        self.batch_capacity = capacity.max(1);
        self.batch_threshold = threshold;
        self
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    pub fn continue_on_failure(&self) -> bool {
        self.continue_on_failure
    }

    pub fn skip_first_failures(&self) -> u32 {
        self.skip_first_failures
    }

    pub fn batch_capacity(&self) -> usize {
        self.batch_capacity
    }

    pub fn batch_threshold(&self) -> Duration {
        self.batch_threshold
    }

    /// Interruptions are never retried.
    pub fn can_retry(&self, error: &Error) -> bool {
        if error.is_interrupted() {
            return false;
        }
        self.retry_on.as_ref().is_none_or(|predicate| predicate(error))
    }
}

impl fmt::Debug for ComputationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ComputationPolicy")
            .field("retry_policy", &self.retry_policy)
            .field("retry_on", &self.retry_on.as_ref().map(|_| "<predicate>"))
            .field("continue_on_failure", &self.continue_on_failure)
            .field("skip_first_failures", &self.skip_first_failures)
            .field("batch_capacity", &self.batch_capacity)
            .field("batch_threshold", &self.batch_threshold)
            .finish()
    }
}
