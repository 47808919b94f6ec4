use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use pin_project::pin_project;
use tokio::time::{Instant, Sleep, sleep_until};
use tracing::debug;

use crate::{Condition, Operation};

/// A [Retry] alternates between running the [Operation] and sleeping the delay handed out by the
/// backoff iterator:
/// ```text
///                 (Ok) -> Ready(Ok)
///                /
/// [Running] ----       (not retryable | backoff exhausted) -> Ready(Err)
///                \    /
///                 (Err)
///                     \
///                      (delay) -> [Sleeping] -> (elapsed) -> [Running]
/// ```
#[pin_project(project = PhaseProj)]
enum Phase<F> {
    Running(#[pin] F),
    Sleeping(#[pin] Sleep),
}

/// Future that keeps running an operation until it succeeds, the [Condition] rejects the error
/// or the backoff runs out. The last error is returned in the latter two cases.
#[pin_project]
pub struct Retry<I, O, C>
where
    O: Operation,
{
    #[pin]
    phase: Phase<O::Future>,
    backoff: I,
    operation: O,
    condition: C,
    attempts: u16,
}

impl<I, O, C> Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    pub fn new<B>(backoff: B, mut operation: O, condition: C) -> Self
    where
        B: IntoIterator<IntoIter = I, Item = Duration>,
    {
        Self {
            phase: Phase::Running(operation.run()),
            backoff: backoff.into_iter(),
            operation,
            condition,
            attempts: 1,
        }
    }
}

impl<I, O, C> Future for Retry<I, O, C>
where
    I: Iterator<Item = Duration>,
    O: Operation,
    C: Condition<O::Error>,
{
    type Output = Result<O::Item, O::Error>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let mut this = self.project();
        loop {
            match this.phase.as_mut().project() {
                PhaseProj::Running(fut) => {
                    let error = match fut.poll(cx) {
                        Poll::Pending => return Poll::Pending,
                        Poll::Ready(Ok(item)) => return Poll::Ready(Ok(item)),
                        Poll::Ready(Err(error)) => error,
                    };
                    if !this.condition.can_retry(&error) {
                        return Poll::Ready(Err(error));
                    }
                    let Some(delay) = this.backoff.next() else {
                        return Poll::Ready(Err(error));
                    };
                    debug!(attempt = *this.attempts, ?delay, "operation failed, backing off");
                    this.phase
                        .set(Phase::Sleeping(sleep_until(Instant::now() + delay)));
                }
                PhaseProj::Sleeping(sleep) => {
                    if sleep.poll(cx).is_pending() {
                        return Poll::Pending;
                    }
                    *this.attempts = this.attempts.saturating_add(1);
                    let next = this.operation.run();
                    this.phase.set(Phase::Running(next));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::future;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::policy::RetryPolicy;
    use crate::strategy::fixed;

    fn counting_failure(counter: &Arc<AtomicUsize>) -> impl FnMut() -> future::Ready<Result<(), usize>> {
        let counter = Arc::clone(counter);
        move || future::ready(Err(counter.fetch_add(1, Ordering::SeqCst) + 1))
    }

    #[tokio::test]
    async fn resolves_without_sleeping_on_success() {
        let result = Retry::new(
            fixed::Interval::from_millis(10_000),
            || future::ready(Ok::<_, ()>("done")),
            |_: &()| true,
        )
        .await;
        assert_eq!(result, Ok("done"));
    }

    #[tokio::test]
    async fn stops_when_condition_rejects() {
        let counter = Arc::new(AtomicUsize::new(0));
        let result = Retry::new(
            fixed::Interval::from_millis(1).take(10),
            counting_failure(&counter),
            |e: &usize| *e < 2,
        )
        .await;
        assert_eq!(result, Err(2));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn gives_up_when_policy_is_exhausted() {
        let counter = Arc::new(AtomicUsize::new(0));
        let policy = RetryPolicy::new()
            .with_max_retries(4)
            .with_delay(Duration::from_millis(1));
        let result = Retry::new(policy.backoff(), counting_failure(&counter), |_: &usize| true).await;
        // the initial run plus one run per retry
        assert_eq!(result, Err(5));
        assert_eq!(counter.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn eventually_succeeds() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cloned = Arc::clone(&counter);
        let started = Instant::now();
        let result = Retry::new(
            fixed::Interval::from_millis(100),
            move || {
                let n = cloned.fetch_add(1, Ordering::SeqCst);
                future::ready(if n < 3 { Err(n) } else { Ok(n) })
            },
            |_: &usize| true,
        )
        .await;
        assert_eq!(result, Ok(3));
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}
