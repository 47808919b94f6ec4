//! Explicit retry combinator. The caller runs the operation itself and feeds every result to a
//! [Retrier], which answers with what to do next:
//!
//! ```text
//!             (Ok) -> Success
//!            /
//! result ---               (retryable && backoff left) -> Retrying { delay }
//!            \            /
//!             (Err) ------
//!                         \
//!                          (otherwise) -> Failed
//! ```
//!
//! This keeps the retry loop in the caller's hands so it can borrow its own state mutably and
//! run hooks between attempts, which a [crate::retry::Retry] future cannot do.

use std::time::Duration;

use crate::policy::RetryPolicy;
use crate::strategy::exponential::Exponential;

/// What the caller should do after an attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Attempt<T, E> {
    /// The operation succeeded.
    Success(T),
    /// The operation failed and may be retried after `delay`. `attempt` is the 1-based number of
    /// the attempt that just failed.
    Retrying { attempt: u16, delay: Duration, error: E },
    /// The operation failed and must not be retried anymore.
    Failed { attempts: u16, error: E },
}

impl<T, E> Attempt<T, E> {
    pub fn is_success(&self) -> bool {
        matches!(self, Attempt::Success(_))
    }
}

/// Tracks the attempts made for one logical operation.
#[derive(Debug)]
pub struct Retrier<B = Exponential> {
    backoff: B,
    attempts: u16,
}

impl Retrier<Exponential> {
    pub fn from_policy(policy: &RetryPolicy) -> Self {
        Retrier::new(policy.backoff())
    }
}

impl<B> Retrier<B>
where
    B: Iterator<Item = Duration>,
{
    pub fn new<I>(backoff: I) -> Self
    where
        I: IntoIterator<IntoIter = B, Item = Duration>,
    {
        Self {
            backoff: backoff.into_iter(),
            attempts: 0,
        }
    }

    /// Number of attempts reported so far.
    pub fn attempts(&self) -> u16 {
        self.attempts
    }

    /// Records the result of one attempt. `retryable` is only consulted for errors.
    pub fn attempt<T, E>(
        &mut self,
        result: Result<T, E>,
        retryable: impl FnOnce(&E) -> bool,
    ) -> Attempt<T, E> {
        self.attempts = self.attempts.saturating_add(1);
        let error = match result {
            Ok(value) => return Attempt::Success(value),
            Err(error) => error,
        };
        if !retryable(&error) {
            return Attempt::Failed {
                attempts: self.attempts,
                error,
            };
        }
        match self.backoff.next() {
            Some(delay) => Attempt::Retrying {
                attempt: self.attempts,
                delay,
                error,
            },
            None => Attempt::Failed {
                attempts: self.attempts,
                error,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategy::fixed;

    #[test]
    fn success_on_first_attempt() {
        let mut retrier = Retrier::from_policy(&RetryPolicy::no_retry());
        let outcome = retrier.attempt(Ok::<_, ()>(7), |_| true);
        assert_eq!(outcome, Attempt::Success(7));
        assert_eq!(retrier.attempts(), 1);
    }

    #[test]
    fn no_retry_fails_immediately() {
        let mut retrier = Retrier::from_policy(&RetryPolicy::no_retry());
        let outcome = retrier.attempt(Err::<(), _>("boom"), |_| true);
        assert_eq!(
            outcome,
            Attempt::Failed {
                attempts: 1,
                error: "boom"
            }
        );
    }

    #[test]
    fn retries_until_backoff_is_exhausted() {
        let policy = RetryPolicy::new()
            .with_max_retries(3)
            .with_delay(Duration::from_millis(1));
        let mut retrier = Retrier::from_policy(&policy);

        let mut retrying = 0;
        loop {
            match retrier.attempt(Err::<(), _>(()), |_| true) {
                Attempt::Retrying { attempt, delay, .. } => {
                    retrying += 1;
                    assert_eq!(attempt, retrying);
                    assert_eq!(delay, Duration::from_millis(1));
                }
                Attempt::Failed { attempts, .. } => {
                    assert_eq!(attempts, 4);
                    break;
                }
                Attempt::Success(_) => unreachable!(),
            }
        }
        assert_eq!(retrying, 3);
    }

    #[test]
    fn non_retryable_error_fails_without_consuming_backoff() {
        let mut retrier = Retrier::new(fixed::Interval::from_millis(1).take(5));
        let outcome = retrier.attempt(Err::<(), _>(42), |e| *e != 42);
        assert!(matches!(outcome, Attempt::Failed { attempts: 1, .. }));
    }

    #[test]
    fn recovers_after_retry() {
        let mut retrier = Retrier::new(fixed::Interval::from_millis(1).take(2));
        assert!(matches!(
            retrier.attempt(Err::<u8, _>("transient"), |_| true),
            Attempt::Retrying { attempt: 1, .. }
        ));
        assert!(retrier.attempt(Ok::<_, &str>(1), |_| true).is_success());
        assert_eq!(retrier.attempts(), 2);
    }
}
