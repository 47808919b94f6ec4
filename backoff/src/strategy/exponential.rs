use std::time::Duration;

use rand::Rng;

use crate::policy::RetryPolicy;

/// Cool-off that grows by `factor` on every retry: `delay * factor^(retry - 1)`, capped by
/// `max_delay`. A `jitter` of `j` spreads every delay uniformly over `[d * (1 - j), d * (1 + j)]`
/// before the cap is applied.
///
/// The iterator yields one item per allowed retry, so `max_retries = Some(3)` yields exactly 3
/// delays and `None` never ends.
///
/// ```
/// use std::time::Duration;
/// use backoff::strategy::exponential::Exponential;
///
/// let delays: Vec<_> = Exponential::new(
///     Duration::from_millis(10),
///     Duration::from_millis(35),
///     2.0,
///     0.0,
///     Some(4),
/// )
/// .collect();
/// assert_eq!(delays, vec![
///     Duration::from_millis(10),
///     Duration::from_millis(20),
///     Duration::from_millis(35),
///     Duration::from_millis(35),
/// ]);
/// ```
#[derive(Debug, Clone)]
pub struct Exponential {
    delay: Duration,
    max_delay: Duration,
    factor: f64,
    jitter: f64,
    max_retries: Option<u16>,
    retries: u16,
}

impl Exponential {
    pub fn new(
        delay: Duration,
        max_delay: Duration,
        factor: f64,
        jitter: f64,
        max_retries: Option<u16>,
    ) -> Self {
        Self {
            delay,
            // a cap below the initial delay would make the first retry wait longer than the cap
            max_delay: max_delay.max(delay),
            factor: factor.max(1.0),
            jitter: jitter.clamp(0.0, 1.0),
            max_retries,
            retries: 0,
        }
    }

    /// Number of delays handed out so far.
    pub fn retries(&self) -> u16 {
        self.retries
    }

    /// Starts over from the initial delay.
    pub fn reset(&mut self) {
        self.retries = 0;
    }

    fn delay_for(&self, retry: u16) -> Duration {
        let exponent = i32::from(retry.saturating_sub(1));
        let mut millis = self.delay.as_millis() as f64 * self.factor.powi(exponent);
        if self.jitter > 0.0 {
            millis *= rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter);
        }
        if !millis.is_finite() {
            return self.max_delay;
        }
        Duration::from_millis(millis as u64).min(self.max_delay)
    }
}

impl From<&RetryPolicy> for Exponential {
    fn from(policy: &RetryPolicy) -> Self {
        Exponential::new(
            policy.delay(),
            policy.max_delay(),
            policy.factor(),
            policy.jitter(),
            policy.max_retries(),
        )
    }
}

impl Iterator for Exponential {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(max_retries) = self.max_retries
            && self.retries >= max_retries
        {
            return None;
        }
        self.retries = self.retries.saturating_add(1);
        Some(self.delay_for(self.retries))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grows_then_caps() {
        let delays: Vec<_> = Exponential::new(
            Duration::from_millis(100),
            Duration::from_millis(300),
            2.0,
            0.0,
            None,
        )
        .take(4)
        .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
                Duration::from_millis(300),
            ]
        );
    }

    #[test]
    fn factor_one_is_a_fixed_delay() {
        let mut backoff =
            Exponential::new(Duration::from_millis(50), Duration::ZERO, 1.0, 0.0, Some(2));
        assert_eq!(backoff.next(), Some(Duration::from_millis(50)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(50)));
        assert_eq!(backoff.next(), None);
    }

    #[test]
    fn zero_retries_yields_nothing() {
        let mut backoff = Exponential::from(&RetryPolicy::no_retry());
        assert_eq!(backoff.next(), None);
        assert_eq!(backoff.retries(), 0);
    }

    #[test]
    fn reset_starts_over() {
        let mut backoff =
            Exponential::new(Duration::from_millis(10), Duration::from_secs(1), 3.0, 0.0, Some(2));
        assert_eq!(backoff.next(), Some(Duration::from_millis(10)));
        assert_eq!(backoff.next(), Some(Duration::from_millis(30)));
        assert_eq!(backoff.next(), None);

        backoff.reset();
        assert_eq!(backoff.retries(), 0);
        assert_eq!(backoff.next(), Some(Duration::from_millis(10)));
    }

    #[test]
    fn jitter_stays_in_range() {
        let mut backoff =
            Exponential::new(Duration::from_millis(100), Duration::from_secs(10), 2.0, 0.5, None);
        for _ in 0..20 {
            backoff.reset();
            let delay = backoff.next().unwrap();
            assert!(delay >= Duration::from_millis(50));
            assert!(delay <= Duration::from_millis(150));
        }
    }
}
