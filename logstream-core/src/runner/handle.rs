use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// How a runner ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerExit {
    /// Stopped, drained or asked by its computation to terminate.
    Completed,
    /// Aborted by a forced shutdown.
    Interrupted,
    /// The computation failed and was not allowed to skip the failure.
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerStatus {
    Created,
    Running,
    Terminated(RunnerExit),
}

impl fmt::Display for RunnerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunnerStatus::Created => write!(f, "created"),
            RunnerStatus::Running => write!(f, "running"),
            RunnerStatus::Terminated(exit) => write!(f, "terminated ({exit:?})"),
        }
    }
}

/// Control side of a runner, shared between the runner task and its pool.
#[derive(Debug)]
pub struct RunnerHandle {
    name: String,
    computation: String,
    stop: CancellationToken,
    interrupt: CancellationToken,
    drain: AtomicBool,
    low_watermark: AtomicU64,
    status: watch::Sender<RunnerStatus>,
    /// true once the runner knows its partitions
    assigned: watch::Sender<bool>,
}

impl RunnerHandle {
    pub(crate) fn new(computation: &str, index: usize) -> Self {
        Self {
            name: format!("{computation}-{index:02}"),
            computation: computation.to_string(),
            stop: CancellationToken::new(),
            interrupt: CancellationToken::new(),
            drain: AtomicBool::new(false),
            low_watermark: AtomicU64::new(0),
            status: watch::Sender::new(RunnerStatus::Created),
            assigned: watch::Sender::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn computation(&self) -> &str {
        &self.computation
    }

    /// Non blocking, the runner exits at the end of its current iteration.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    /// The runner keeps processing until its input is starving.
    pub fn drain(&self) {
        self.drain.store(true, Ordering::SeqCst);
    }

    /// Aborts any pending read, sleep or backoff of the runner.
    pub fn interrupt(&self) {
        self.interrupt.cancel();
    }

    pub fn is_stop_requested(&self) -> bool {
        self.stop.is_cancelled()
    }

    pub fn is_drain_requested(&self) -> bool {
        self.drain.load(Ordering::SeqCst)
    }

    pub(crate) fn stop_token(&self) -> &CancellationToken {
        &self.stop
    }

    pub(crate) fn interrupt_token(&self) -> &CancellationToken {
        &self.interrupt
    }

    pub fn status(&self) -> RunnerStatus {
        *self.status.borrow()
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.status(), RunnerStatus::Terminated(_))
    }

    pub(crate) fn set_status(&self, status: RunnerStatus) {
        self.status.send_replace(status);
    }

    /// Packed low watermark of the runner, 0 until something is processed.
    pub fn low_watermark(&self) -> u64 {
        self.low_watermark.load(Ordering::SeqCst)
    }

    pub(crate) fn set_low_watermark(&self, watermark: u64) {
        self.low_watermark.store(watermark, Ordering::SeqCst);
    }

    pub(crate) fn release_assignment(&self) {
        self.assigned.send_replace(true);
    }

    pub fn is_assigned(&self) -> bool {
        *self.assigned.borrow()
    }

    /// Returns false if the partitions are still unknown after `timeout`.
    pub async fn wait_for_assignment(&self, timeout: Duration) -> bool {
        let mut assigned = self.assigned.subscribe();
        let result = tokio::time::timeout(timeout, assigned.wait_for(|a| *a)).await;
        matches!(result, Ok(Ok(_)))
    }

    /// Returns false if the runner is still alive after `timeout`.
    pub async fn wait_for_termination(&self, timeout: Duration) -> bool {
        let mut status = self.status.subscribe();
        let result = tokio::time::timeout(
            timeout,
            status.wait_for(|s| matches!(s, RunnerStatus::Terminated(_))),
        )
        .await;
        matches!(result, Ok(Ok(_)))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn test_assignment_latch() {
        let handle = Arc::new(RunnerHandle::new("counter", 1));
        assert_eq!(handle.name(), "counter-01");
        assert!(!handle.wait_for_assignment(Duration::from_millis(10)).await);

        let releaser = Arc::clone(&handle);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            releaser.release_assignment();
        });
        assert!(handle.wait_for_assignment(Duration::from_secs(5)).await);
        assert!(handle.is_assigned());
    }

    #[tokio::test]
    async fn test_status() {
        let handle = RunnerHandle::new("counter", 0);
        assert_eq!(handle.status(), RunnerStatus::Created);
        assert!(!handle.wait_for_termination(Duration::from_millis(5)).await);
        handle.set_status(RunnerStatus::Terminated(RunnerExit::Completed));
        assert!(handle.is_terminated());
        assert!(handle.wait_for_termination(Duration::ZERO).await);

        assert!(!handle.is_stop_requested());
        handle.stop();
        assert!(handle.is_stop_requested());
        assert!(handle.stop_token().is_cancelled());
        assert!(!handle.interrupt_token().is_cancelled());
    }
}
