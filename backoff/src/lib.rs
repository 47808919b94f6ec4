//! Retry building blocks used by the computation runners.
//!
//! - [policy::RetryPolicy] is the user facing description of "how many times and how long to
//!   wait in between".
//! - [strategy] turns a policy into an iterator of cool-off [Duration]s.
//! - [attempt::Retrier] is the explicit combinator a caller drives by hand when it has to run
//!   hooks between attempts (e.g., notify a computation before retrying it).
//! - [retry::Retry] is the fire-and-forget [Future] flavour, used when nothing has to happen
//!   between attempts.
//!
//! [Duration]: std::time::Duration

use std::future::Future;

pub mod attempt;
pub mod policy;
pub mod retry;
pub mod strategy;

/// An operation that can be run more than once, every run produces a new [Future].
pub trait Operation {
    type Item;
    type Error;
    type Future: Future<Output = Result<Self::Item, Self::Error>>;

    fn run(&mut self) -> Self::Future;
}

impl<I, E, T, F> Operation for F
where
    T: Future<Output = Result<I, E>>,
    F: FnMut() -> T,
{
    type Item = I;
    type Error = E;
    type Future = T;

    fn run(&mut self) -> Self::Future {
        self()
    }
}

/// Decides whether a failed [Operation] may be attempted again.
pub trait Condition<E> {
    fn can_retry(&mut self, error: &E) -> bool;
}

impl<E, F> Condition<E> for F
where
    F: FnMut(&E) -> bool,
{
    fn can_retry(&mut self, error: &E) -> bool {
        self(error)
    }
}
