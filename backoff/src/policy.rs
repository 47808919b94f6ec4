use std::time::Duration;

use crate::strategy::exponential::Exponential;

const DEFAULT_MAX_RETRIES: u16 = 2;
const DEFAULT_DELAY: Duration = Duration::from_millis(100);
const DEFAULT_FACTOR: f64 = 1.0;

/// How often a failed operation is retried and how long to wait in between.
///
/// `max_retries` counts *retries*, the initial attempt is not included: a policy with
/// `max_retries = Some(3)` runs an always failing operation 4 times. `None` retries forever.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    max_retries: Option<u16>,
    delay: Duration,
    max_delay: Duration,
    factor: f64,
    jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: Some(DEFAULT_MAX_RETRIES),
            delay: DEFAULT_DELAY,
            max_delay: DEFAULT_DELAY,
            factor: DEFAULT_FACTOR,
            jitter: 0.0,
        }
    }
}

impl RetryPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that gives up after the first failure.
    pub fn no_retry() -> Self {
        Self {
            max_retries: Some(0),
            delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            ..Default::default()
        }
    }

    pub fn with_max_retries(mut self, max_retries: u16) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_unlimited_retries(mut self) -> Self {
        self.max_retries = None;
        self
    }

    /// Constant delay between retries.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self.max_delay = delay;
        self.factor = 1.0;
        self
    }

    /// Delay growing by `factor` after every retry, never above `max_delay`.
    pub fn with_backoff(mut self, delay: Duration, max_delay: Duration, factor: f64) -> Self {
        self.delay = delay;
        self.max_delay = max_delay;
        self.factor = factor;
        self
    }

    /// Randomization factor between 0.0 and 1.0 applied to every delay.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn max_retries(&self) -> Option<u16> {
        self.max_retries
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn factor(&self) -> f64 {
        self.factor
    }

    pub fn jitter(&self) -> f64 {
        self.jitter
    }

    /// A fresh iterator over the delays this policy allows.
    pub fn backoff(&self) -> Exponential {
        Exponential::from(self)
    }
}
