//! The runners of one computation.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::Error;
use crate::Result;
use crate::computation::{ComputationMetadataMapping, ComputationSupplier};
use crate::config::Settings;
use crate::log::{LogManager, LogPartition};
use crate::runner::{
    ComputationRunner, RunnerComponents, RunnerExit, RunnerHandle, RunnerShared, RunnerStatus,
};
use crate::watermark::Watermark;

/// Time given to interrupted runners to destroy their computation before being aborted.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

pub(crate) struct PoolComponents {
    pub(crate) metadata: Arc<ComputationMetadataMapping>,
    pub(crate) supplier: ComputationSupplier,
    /// one entry per runner
    pub(crate) assignments: Vec<Vec<LogPartition>>,
    pub(crate) log_manager: Arc<dyn LogManager>,
    pub(crate) settings: Arc<Settings>,
    pub(crate) subscribe: bool,
    pub(crate) shared: Arc<RunnerShared>,
}

pub struct ComputationPool {
    metadata: Arc<ComputationMetadataMapping>,
    supplier: ComputationSupplier,
    assignments: Vec<Vec<LogPartition>>,
    log_manager: Arc<dyn LogManager>,
    settings: Arc<Settings>,
    subscribe: bool,
    shared: Arc<RunnerShared>,
    started: bool,
    runners: Vec<Arc<RunnerHandle>>,
    tasks: Vec<JoinHandle<RunnerExit>>,
}

impl ComputationPool {
    pub(crate) fn new(components: PoolComponents) -> Self {
        Self {
            metadata: components.metadata,
            supplier: components.supplier,
            assignments: components.assignments,
            log_manager: components.log_manager,
            settings: components.settings,
            subscribe: components.subscribe,
            shared: components.shared,
            started: false,
            runners: vec![],
            tasks: vec![],
        }
    }

    pub fn name(&self) -> &str {
        self.metadata.name()
    }

    pub fn metadata(&self) -> &ComputationMetadataMapping {
        &self.metadata
    }

    pub fn assignments(&self) -> &[Vec<LogPartition>] {
        &self.assignments
    }

    pub fn runners(&self) -> &[Arc<RunnerHandle>] {
        &self.runners
    }

    /// Spawns one runner task per assignment.
    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(Error::Processor(format!(
                "pool {} is already started",
                self.name()
            )));
        }
        self.started = true;
        info!(computation = %self.name(), runners = self.assignments.len(), subscribe = self.subscribe, "Starting pool");
        for (index, partitions) in self.assignments.iter().enumerate() {
            let handle = Arc::new(RunnerHandle::new(self.metadata.name(), index));
            let runner = ComputationRunner::new(RunnerComponents {
                handle: Arc::clone(&handle),
                metadata: Arc::clone(&self.metadata),
                supplier: Arc::clone(&self.supplier),
                log_manager: Arc::clone(&self.log_manager),
                settings: Arc::clone(&self.settings),
                partitions: partitions.clone(),
                subscribe: self.subscribe,
                shared: Arc::clone(&self.shared),
            });
            let task_handle = Arc::clone(&handle);
            let shared = Arc::clone(&self.shared);
            let task = tokio::spawn(async move {
                match AssertUnwindSafe(runner.run()).catch_unwind().await {
                    Ok(exit) => exit,
                    Err(_) => {
                        error!(runner = %task_handle.name(), "Runner panicked");
                        shared.mark_failed(task_handle.computation());
                        task_handle.release_assignment();
                        task_handle.set_status(RunnerStatus::Terminated(RunnerExit::Failed));
                        RunnerExit::Failed
                    }
                }
            });
            self.runners.push(handle);
            self.tasks.push(task);
        }
        Ok(())
    }

    /// Returns false if a runner still does not know its partitions after `timeout`.
    pub async fn wait_for_assignments(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        for runner in &self.runners {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !runner.wait_for_assignment(remaining).await {
                warn!(runner = %runner.name(), ?timeout, "No assignment");
                return false;
            }
        }
        true
    }

    async fn wait_for_termination(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        for runner in &self.runners {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !runner.wait_for_termination(remaining).await {
                warn!(runner = %runner.name(), ?timeout, "Runner still alive");
                return false;
            }
        }
        true
    }

    /// Asks the runners to stop and waits for them. On timeout the runners are shut down and
    /// false is returned.
    pub async fn stop(&self, timeout: Duration) -> bool {
        info!(computation = %self.name(), "Stopping pool");
        self.runners.iter().for_each(|r| r.stop());
        self.terminate_within(timeout).await
    }

    /// Lets the runners process until their input starves, then waits for them. On timeout the
    /// runners are shut down and false is returned.
    pub async fn drain_and_stop(&self, timeout: Duration) -> bool {
        info!(computation = %self.name(), "Draining pool");
        self.runners.iter().for_each(|r| r.drain());
        self.terminate_within(timeout).await
    }

    async fn terminate_within(&self, timeout: Duration) -> bool {
        if self.wait_for_termination(timeout).await {
            info!(computation = %self.name(), "Pool terminated");
            return true;
        }
        warn!(computation = %self.name(), ?timeout, "Pool not terminated in time, shutting down");
        self.shutdown().await;
        false
    }

    /// Interrupts the runners, aborts the ones still alive after a grace period.
    pub async fn shutdown(&self) {
        self.runners.iter().for_each(|r| r.interrupt());
        if self.wait_for_termination(SHUTDOWN_GRACE).await {
            return;
        }
        for (runner, task) in self.runners.iter().zip(&self.tasks) {
            if !runner.is_terminated() {
                error!(runner = %runner.name(), "Aborting runner");
                task.abort();
                runner.release_assignment();
                runner.set_status(RunnerStatus::Terminated(RunnerExit::Interrupted));
            }
        }
    }

    /// True once started and every runner is terminated, a pool without runner terminates
    /// right away.
    pub fn is_terminated(&self) -> bool {
        self.started && self.runners.iter().all(|r| r.is_terminated())
    }

    pub fn low_watermark(&self) -> u64 {
        aggregate_low_watermark(self.runners.iter().map(|r| r.low_watermark()))
    }
}

/// Low watermark of a set of runners: the lowest pending watermark if any, otherwise the
/// highest completed one. Values up to 1 mean "nothing processed" and are ignored.
pub fn aggregate_low_watermark(watermarks: impl IntoIterator<Item = u64>) -> u64 {
    let (completed, pending): (Vec<u64>, Vec<u64>) = watermarks
        .into_iter()
        .filter(|w| *w > 1)
        .partition(|w| Watermark::of_value(*w).is_completed());
    pending
        .into_iter()
        .min()
        .or_else(|| completed.into_iter().max())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wm(timestamp: i64, completed: bool) -> u64 {
        let watermark = Watermark::of_timestamp(timestamp).unwrap();
        if completed {
            Watermark::completed_of(watermark).value()
        } else {
            watermark.value()
        }
    }

    #[test]
    fn test_aggregate_low_watermark() {
        assert_eq!(
            aggregate_low_watermark([wm(100, true), wm(50, false)]),
            wm(50, false)
        );
        assert_eq!(
            aggregate_low_watermark([wm(100, true), wm(80, true)]),
            wm(100, true)
        );
        assert_eq!(
            aggregate_low_watermark([wm(100, false), wm(80, false), 0, 1]),
            wm(80, false)
        );
        assert_eq!(aggregate_low_watermark([0, 1]), 0);
        assert_eq!(aggregate_low_watermark(Vec::new()), 0);
    }
}
