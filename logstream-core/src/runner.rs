//! A [ComputationRunner] drives one computation instance over its partitions, in its own task.
//!
//! Every iteration of the loop fires the due timers, then reads and processes at most one
//! record:
//!
//! ```text
//!           +--------------------------------------------------------------+
//!           v                                                              |
//! (rebalance events) -> (due timers) -> (read one record) -> (checkpoint if asked) -> (idle pause)
//! ```
//!
//! Records produced by the computation are buffered in its context and only appended on
//! checkpoint, right before the consumed offsets are committed. A failed checkpoint restarts
//! the loop from the last committed offsets with a fresh context.

use std::sync::Arc;
use std::time::Duration;

use backoff::attempt::{Attempt, Retrier};
use chrono::Utc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::Error;
use crate::Result;
use crate::computation::{
    Computation, ComputationContext, ComputationMetadataMapping, ComputationSupplier,
};
use crate::config::Settings;
use crate::log::{LogManager, LogPartition, LogTailer, RebalanceListener, partition_of};
use crate::metrics::{computation_labels, runner_metrics, stream_labels};
use crate::record::{Flags, Record};
use crate::watermark::{Watermark, WatermarkInterval};

pub mod handle;
pub mod shared;

pub use handle::{RunnerExit, RunnerHandle, RunnerStatus};
pub use shared::{FailureBudget, RunnerShared};

/// Longest wait for a record when nothing was read recently.
pub const READ_TIMEOUT: Duration = Duration::from_millis(25);
/// A draining runner stops once nothing was read (or fired, for a source) for this long.
pub const STARVING_TIMEOUT: Duration = Duration::from_secs(1);
/// Pause of an iteration that did nothing.
pub const INACTIVITY_BREAK: Duration = Duration::from_millis(100);
/// Number of times the loop is restarted after a checkpoint failure.
pub const CHECKPOINT_MAX_RETRY: u32 = 3;
pub const CHECKPOINT_PAUSE: Duration = Duration::from_millis(200);

#[derive(Debug)]
enum RebalanceEvent {
    Revoked(Vec<LogPartition>),
    Assigned(Vec<LogPartition>),
}

/// Forwards the rebalance callbacks of the tailer to the runner loop.
struct ChannelRebalanceListener {
    tx: mpsc::UnboundedSender<RebalanceEvent>,
}

impl RebalanceListener for ChannelRebalanceListener {
    fn on_partitions_revoked(&self, partitions: &[LogPartition]) {
        let _ = self.tx.send(RebalanceEvent::Revoked(partitions.to_vec()));
    }

    fn on_partitions_assigned(&self, partitions: &[LogPartition]) {
        let _ = self.tx.send(RebalanceEvent::Assigned(partitions.to_vec()));
    }
}

/// A unit of work handed to the computation.
enum Task<'a> {
    Record { input_stream: &'a str, record: Record },
    Timer { key: &'a str, timestamp: i64 },
}

/// Components a runner is built from.
pub(crate) struct RunnerComponents {
    pub(crate) handle: Arc<RunnerHandle>,
    pub(crate) metadata: Arc<ComputationMetadataMapping>,
    pub(crate) supplier: ComputationSupplier,
    pub(crate) log_manager: Arc<dyn LogManager>,
    pub(crate) settings: Arc<Settings>,
    /// explicit assignment, ignored in subscribe mode
    pub(crate) partitions: Vec<LogPartition>,
    pub(crate) subscribe: bool,
    pub(crate) shared: Arc<RunnerShared>,
}

pub(crate) struct ComputationRunner {
    handle: Arc<RunnerHandle>,
    metadata: Arc<ComputationMetadataMapping>,
    log_manager: Arc<dyn LogManager>,
    settings: Arc<Settings>,
    partitions: Vec<LogPartition>,
    subscribe: bool,
    shared: Arc<RunnerShared>,
    computation: Box<dyn Computation>,
    context: ComputationContext,
    tailer: Option<Box<dyn LogTailer>>,
    rebalance: Option<mpsc::UnboundedReceiver<RebalanceEvent>>,
    low_watermark: WatermarkInterval,
    last_read: Instant,
    last_timer: Instant,
    stop_signaled: bool,
    failed: bool,
    labels: Vec<(String, String)>,
}

impl ComputationRunner {
    pub(crate) fn new(components: RunnerComponents) -> Self {
        let RunnerComponents {
            handle,
            metadata,
            supplier,
            log_manager,
            settings,
            partitions,
            subscribe,
            shared,
        } = components;
        let context = ComputationContext::new(
            Arc::clone(&metadata),
            settings.policy(metadata.name()).clone(),
            vec![],
            handle.stop_token().clone(),
        );
        let labels = computation_labels(metadata.name());
        Self {
            computation: supplier(),
            // sources have nothing to subscribe to
            subscribe: subscribe && !metadata.is_source(),
            handle,
            metadata,
            log_manager,
            settings,
            partitions,
            shared,
            context,
            tailer: None,
            rebalance: None,
            low_watermark: WatermarkInterval::new(),
            last_read: Instant::now(),
            last_timer: Instant::now(),
            stop_signaled: false,
            failed: false,
            labels,
        }
    }

    /// Runs until the runner is stopped, drained, interrupted or its computation terminates.
    /// The computation is destroyed and the tailer closed on every path.
    pub(crate) async fn run(mut self) -> RunnerExit {
        let handle = Arc::clone(&self.handle);
        let metrics = runner_metrics();
        handle.set_status(RunnerStatus::Running);
        metrics.runners.get_or_create(&self.labels).inc();
        info!(runner = %handle.name(), partitions = ?self.partitions, subscribe = self.subscribe, "Starting runner");

        let interrupt = handle.interrupt_token().clone();
        let result = tokio::select! {
            _ = interrupt.cancelled() => Err(Error::Interrupted),
            result = self.process() => result,
        };

        self.computation.destroy().await;
        if let Some(mut tailer) = self.tailer.take()
            && let Err(e) = tailer.close().await
        {
            warn!(runner = %handle.name(), ?e, "Failed to close tailer");
        }

        let exit = match result {
            Ok(()) if self.failed => RunnerExit::Failed,
            Ok(()) => RunnerExit::Completed,
            Err(Error::Interrupted) => RunnerExit::Interrupted,
            Err(e) => {
                error!(runner = %handle.name(), ?e, "Runner terminated on error");
                self.shared.mark_failed(self.metadata.name());
                RunnerExit::Failed
            }
        };
        info!(runner = %handle.name(), ?exit, low_watermark = %Watermark::of_value(handle.low_watermark()), "Runner terminated");
        // nobody waits for partitions that will never come
        handle.release_assignment();
        handle.set_status(RunnerStatus::Terminated(exit));
        metrics.runners.get_or_create(&self.labels).dec();
        exit
    }

    async fn process(&mut self) -> Result<()> {
        self.open_tailer().await?;
        if !self.subscribe {
            let partitions = self.partitions.clone();
            self.reset_context(partitions).await?;
            self.handle.release_assignment();
        }
        self.last_read = Instant::now();
        self.last_timer = Instant::now();

        let mut retries = 0;
        loop {
            let error = match self.process_loop().await {
                Err(Error::Checkpoint(reason)) => reason,
                other => return other,
            };
            retries += 1;
            runner_metrics()
                .checkpoint_failures
                .get_or_create(&self.labels)
                .inc();
            if retries > CHECKPOINT_MAX_RETRY {
                error!(runner = %self.handle.name(), %error, "Too many checkpoint failures, terminating");
                return Err(Error::Checkpoint(error));
            }
            warn!(runner = %self.handle.name(), %error, retries, "Checkpoint failure, restarting from the last committed offsets");
            tokio::time::sleep(CHECKPOINT_PAUSE).await;
            let tailer = self.tailer()?;
            tailer.to_last_committed().await?;
            let assignments = tailer.assignments();
            self.reset_context(assignments).await?;
        }
    }

    async fn open_tailer(&mut self) -> Result<()> {
        let group = self.metadata.name().to_string();
        let tailer = if self.subscribe {
            let (tx, rx) = mpsc::unbounded_channel();
            self.rebalance = Some(rx);
            let streams: Vec<String> = self.metadata.input_streams().iter().cloned().collect();
            let listener = Arc::new(ChannelRebalanceListener { tx });
            self.log_manager.subscribe(&group, streams, listener).await?
        } else {
            self.log_manager
                .create_tailer(&group, self.partitions.clone())
                .await?
        };
        debug!(runner = %self.handle.name(), ?tailer, "Tailer opened");
        self.tailer = Some(tailer);
        Ok(())
    }

    fn tailer(&mut self) -> Result<&mut Box<dyn LogTailer>> {
        self.tailer
            .as_mut()
            .ok_or_else(|| Error::Processor(format!("runner {} has no tailer", self.handle.name())))
    }

    /// Replaces the context, whatever was not checkpointed is lost.
    async fn reset_context(&mut self, partitions: Vec<LogPartition>) -> Result<()> {
        self.context = ComputationContext::new(
            Arc::clone(&self.metadata),
            self.settings.policy(self.metadata.name()).clone(),
            partitions,
            self.handle.stop_token().clone(),
        );
        self.computation.init(&mut self.context).await
    }

    async fn process_loop(&mut self) -> Result<()> {
        while self.continue_loop() {
            let rebalanced = self.apply_rebalance().await?;
            let fired = self.process_timers().await?;
            let read = self.process_record().await?;
            if !(rebalanced || fired || read) {
                pause(self.handle.stop_token(), INACTIVITY_BREAK).await;
            }
            self.update_low_watermark();
        }
        Ok(())
    }

    fn continue_loop(&mut self) -> bool {
        if self.context.requires_termination() {
            info!(runner = %self.handle.name(), "Terminated by the computation");
            return false;
        }
        if self.handle.is_stop_requested() {
            info!(runner = %self.handle.name(), "Stop requested");
            self.signal_stop();
            return false;
        }
        if self.handle.is_drain_requested() {
            let last_activity = if self.metadata.is_source() {
                self.last_timer
            } else {
                self.last_read
            };
            if last_activity.elapsed() > STARVING_TIMEOUT {
                info!(runner = %self.handle.name(), "Drained");
                self.signal_stop();
                return false;
            }
        }
        true
    }

    fn signal_stop(&mut self) {
        if !self.stop_signaled {
            self.stop_signaled = true;
            self.computation.signal_stop();
        }
    }

    async fn apply_rebalance(&mut self) -> Result<bool> {
        let Some(rebalance) = self.rebalance.as_mut() else {
            return Ok(false);
        };
        let mut events = vec![];
        while let Ok(event) = rebalance.try_recv() {
            events.push(event);
        }
        let applied = !events.is_empty();
        for event in events {
            match event {
                RebalanceEvent::Revoked(partitions) => {
                    info!(runner = %self.handle.name(), ?partitions, "Partitions revoked");
                }
                RebalanceEvent::Assigned(partitions) => {
                    info!(runner = %self.handle.name(), ?partitions, "Partitions assigned");
                    self.reset_context(partitions).await?;
                    self.last_read = Instant::now();
                    self.handle.release_assignment();
                }
            }
        }
        Ok(applied)
    }

    async fn process_timers(&mut self) -> Result<bool> {
        let due = self.context.due_timers(Utc::now().timestamp_millis());
        if due.is_empty() {
            return Ok(false);
        }
        for (key, timestamp) in due {
            // an earlier timer may have removed it
            if self.context.remove_timer(&key).is_none() {
                continue;
            }
            self.process_with_retry(Task::Timer {
                key: &key,
                timestamp,
            })
            .await?;
            runner_metrics().timers.get_or_create(&self.labels).inc();
            if self.context.requires_termination() {
                break;
            }
        }
        self.last_timer = Instant::now();
        self.check_source_low_watermark();
        self.checkpoint_if_necessary().await?;
        Ok(true)
    }

    async fn process_record(&mut self) -> Result<bool> {
        if self.context.requires_termination() || self.metadata.is_source() {
            return Ok(false);
        }
        if !self.subscribe && self.context.is_spare_computation() {
            return Ok(false);
        }
        // just read something, poll without waiting
        let timeout = READ_TIMEOUT.min(self.last_read.elapsed());
        let log_record = self.tailer()?.read(timeout).await?;
        // the tailer runs the rebalance callbacks inside read
        self.apply_rebalance().await?;
        let Some(log_record) = log_record else {
            return Ok(false);
        };
        self.last_read = Instant::now();

        let stream = log_record.offset.partition.stream.clone();
        let record = self.settings.codec(&stream).decode(&log_record.data)?;
        self.context.set_last_offset(log_record.offset.clone());
        let Some(record) = self
            .settings
            .filters(&stream)
            .after_read(record, &log_record.offset)
        else {
            debug!(runner = %self.handle.name(), offset = %log_record.offset, "Record filtered out");
            return Ok(true);
        };
        if record.watermark() > 0 {
            self.low_watermark.mark_value(record.watermark());
        }
        let poison_pill = record.has_flag(Flags::POISON_PILL);
        let commit = record.has_flag(Flags::COMMIT);
        let input_stream = self
            .metadata
            .reverse_map(&stream)
            .unwrap_or(stream.as_str())
            .to_string();

        let start = Instant::now();
        self.process_with_retry(Task::Record {
            input_stream: &input_stream,
            record,
        })
        .await?;
        let metrics = runner_metrics();
        let labels = stream_labels(self.metadata.name(), &stream);
        metrics.records.get_or_create(&labels).inc();
        metrics
            .processing_time
            .get_or_create(&labels)
            .observe(start.elapsed().as_micros() as f64);

        if poison_pill && !self.context.requires_termination() {
            info!(runner = %self.handle.name(), offset = %log_record.offset, "Poison pill received, checkpoint and stop");
            self.checkpoint().await?;
            self.handle.stop();
        } else if commit && !self.context.requires_termination() {
            self.context.ask_for_checkpoint();
        }
        self.check_source_low_watermark();
        self.checkpoint_if_necessary().await?;
        Ok(true)
    }

    /// Runs the task until it succeeds or the retries are exhausted, then applies the
    /// fallback of the policy. Only an interruption is returned as an error.
    async fn process_with_retry(&mut self, task: Task<'_>) -> Result<()> {
        let policy = self.context.policy().clone();
        let mut retrier = Retrier::from_policy(policy.retry_policy());
        loop {
            let result = match &task {
                Task::Record {
                    input_stream,
                    record,
                } => {
                    self.computation
                        .process_record(&mut self.context, input_stream, record.clone())
                        .await
                }
                Task::Timer { key, timestamp } => {
                    self.computation
                        .process_timer(&mut self.context, key, *timestamp)
                        .await
                }
            };
            match retrier.attempt(result, |e| policy.can_retry(e)) {
                Attempt::Success(()) => return Ok(()),
                Attempt::Retrying {
                    attempt,
                    delay,
                    error,
                } => {
                    warn!(runner = %self.handle.name(), attempt, ?delay, ?error, "Processing failure, retrying");
                    runner_metrics().retries.get_or_create(&self.labels).inc();
                    self.computation
                        .process_retry(&mut self.context, &error)
                        .await;
                    tokio::time::sleep(delay).await;
                }
                Attempt::Failed { attempts, error } => {
                    if error.is_interrupted() {
                        return Err(error);
                    }
                    self.computation
                        .process_failure(&mut self.context, &error)
                        .await;
                    self.fallback(&error, attempts);
                    return Ok(());
                }
            }
        }
    }

    fn fallback(&mut self, error: &Error, attempts: u16) {
        let name = self.metadata.name();
        let policy = self.context.policy();
        let skip = policy.continue_on_failure()
            || self
                .shared
                .budget()
                .try_skip(policy.skip_first_failures());
        let metrics = runner_metrics();
        if skip {
            warn!(runner = %self.handle.name(), attempts, ?error, offset = ?self.context.last_offset(), "Skipping failure");
            self.context.ask_for_checkpoint();
            metrics.skipped_failures.get_or_create(&self.labels).inc();
        } else {
            error!(runner = %self.handle.name(), attempts, ?error, offset = ?self.context.last_offset(), "Terminating computation on failure");
            self.context.cancel_ask_for_checkpoint();
            self.context.ask_for_termination();
            self.failed = true;
            self.shared.mark_failed(name);
            metrics.failures.get_or_create(&self.labels).inc();
        }
    }

    fn check_source_low_watermark(&mut self) {
        let watermark = self.context.source_low_watermark();
        if watermark > 0 {
            self.low_watermark.mark_value(watermark);
            self.context.set_source_low_watermark(0);
        }
    }

    fn update_low_watermark(&mut self) {
        let low = self.low_watermark.low();
        if low.value() == self.handle.low_watermark() {
            return;
        }
        self.handle.set_low_watermark(low.value());
        runner_metrics()
            .low_watermark
            .get_or_create(&self.labels)
            .set(low.timestamp());
    }

    async fn checkpoint_if_necessary(&mut self) -> Result<()> {
        if self.context.need_checkpoint() {
            self.checkpoint().await?;
        }
        Ok(())
    }

    async fn checkpoint(&mut self) -> Result<()> {
        let start = Instant::now();
        let metrics = runner_metrics();
        match self.try_checkpoint().await {
            Ok(()) => {
                metrics.checkpoints.get_or_create(&self.labels).inc();
                metrics
                    .checkpoint_time
                    .get_or_create(&self.labels)
                    .observe(start.elapsed().as_micros() as f64);
                debug!(runner = %self.handle.name(), low_watermark = %self.low_watermark.low(), "Checkpoint done");
                Ok(())
            }
            Err(Error::Interrupted) => Err(Error::Interrupted),
            Err(e) => {
                error!(runner = %self.handle.name(), ?e, "Checkpoint failure");
                Err(Error::Checkpoint(e.to_string()))
            }
        }
    }

    /// Appends the produced records, saves the computation state then commits the offsets.
    async fn try_checkpoint(&mut self) -> Result<()> {
        let low = self.low_watermark.low().value();
        let metrics = runner_metrics();
        for (stream, records) in self.context.take_records() {
            let codec = self.settings.codec(&stream);
            let filters = self.settings.filters(&stream);
            let partitions = self.settings.partitions(&stream);
            let labels = stream_labels(self.metadata.name(), &stream);
            for record in records {
                let record = if record.watermark() == 0 {
                    record.with_watermark(low)
                } else {
                    record
                };
                let Some(record) = filters.before_append(record) else {
                    continue;
                };
                let partition = partition_of(record.key(), partitions);
                let data = codec.encode(&record)?;
                let offset = self.log_manager.append(&stream, partition, data).await?;
                filters.after_append(&record, &offset);
                metrics.appended.get_or_create(&labels).inc();
            }
        }
        self.computation.checkpoint_state(&self.context).await?;
        self.tailer()?.commit().await?;
        self.low_watermark.checkpoint();
        self.context.cancel_ask_for_checkpoint();
        Ok(())
    }
}

/// Sleeps unless a stop is requested in the meantime.
async fn pause(stop: &CancellationToken, duration: Duration) {
    tokio::select! {
        _ = tokio::time::sleep(duration) => {},
        _ = stop.cancelled() => {},
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::computation::{ComputationBase, ComputationMetadata};
    use crate::log::MemLogManager;

    /// Forwards its input and counts what it sees.
    struct Forward {
        base: ComputationBase,
        processed: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Computation for Forward {
        fn metadata(&self) -> &ComputationMetadata {
            self.base.metadata()
        }

        async fn process_record(
            &mut self,
            context: &mut ComputationContext,
            _input_stream: &str,
            record: Record,
        ) -> Result<()> {
            self.processed.fetch_add(1, Ordering::SeqCst);
            context.produce_record("o1", record)?;
            context.ask_for_checkpoint();
            Ok(())
        }

        fn signal_stop(&mut self) {
            self.stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        manager: MemLogManager,
        handle: Arc<RunnerHandle>,
        runner: ComputationRunner,
        processed: Arc<AtomicUsize>,
        stops: Arc<AtomicUsize>,
    }

    async fn fixture() -> Fixture {
        let manager = MemLogManager::new();
        manager.create_if_not_exists("in", 1).await.unwrap();
        manager.create_if_not_exists("out", 1).await.unwrap();
        let processed = Arc::new(AtomicUsize::new(0));
        let stops = Arc::new(AtomicUsize::new(0));
        let supplier: ComputationSupplier = {
            let processed = Arc::clone(&processed);
            let stops = Arc::clone(&stops);
            Arc::new(move || -> Box<dyn Computation> {
                Box::new(Forward {
                    base: ComputationBase::new("forward", 1, 1).unwrap(),
                    processed: Arc::clone(&processed),
                    stops: Arc::clone(&stops),
                })
            })
        };
        let base = ComputationBase::new("forward", 1, 1).unwrap();
        let mapping = [("i1", "in"), ("o1", "out")]
            .into_iter()
            .map(|(l, p)| (l.to_string(), p.to_string()))
            .collect();
        let metadata = ComputationMetadataMapping::new(base.metadata(), &mapping).unwrap();
        let handle = Arc::new(RunnerHandle::new("forward", 0));
        let runner = ComputationRunner::new(RunnerComponents {
            handle: Arc::clone(&handle),
            metadata: Arc::new(metadata),
            supplier,
            log_manager: Arc::new(manager.clone()),
            settings: Arc::new(Settings::new(1, 1)),
            partitions: vec![LogPartition::of("in", 0)],
            subscribe: false,
            shared: Arc::new(RunnerShared::new()),
        });
        Fixture {
            manager,
            handle,
            runner,
            processed,
            stops,
        }
    }

    async fn append(manager: &MemLogManager, record: Record) {
        let data = crate::codec::default_codec().encode(&record).unwrap();
        manager.append("in", 0, data).await.unwrap();
    }

    #[tokio::test]
    async fn test_forward_then_stop() {
        let fixture = fixture().await;
        for i in 0..3 {
            let record = Record::of(format!("k{i}"), "v")
                .with_watermark(Watermark::of_timestamp(1_000 + i).unwrap().value());
            append(&fixture.manager, record).await;
        }
        let task = tokio::spawn(fixture.runner.run());
        assert!(fixture.handle.wait_for_assignment(Duration::from_secs(1)).await);

        let partition = LogPartition::of("in", 0);
        let deadline = Instant::now() + Duration::from_secs(5);
        while fixture.manager.committed("forward", &partition) < 3 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        fixture.handle.stop();
        assert_eq!(task.await.unwrap(), RunnerExit::Completed);

        assert_eq!(fixture.processed.load(Ordering::SeqCst), 3);
        assert_eq!(fixture.stops.load(Ordering::SeqCst), 1);
        assert_eq!(fixture.manager.committed("forward", &partition), 3);
        let lag = fixture.manager.lag("out", "reader").await.unwrap();
        assert_eq!(lag.upper, 3);
        let low = Watermark::of_value(fixture.handle.low_watermark());
        assert_eq!(low.timestamp(), 1_002);
        assert!(low.is_completed());
        assert_eq!(fixture.handle.status(), RunnerStatus::Terminated(RunnerExit::Completed));
    }

    #[tokio::test]
    async fn test_poison_pill() {
        let fixture = fixture().await;
        append(&fixture.manager, Record::of("k1", "v")).await;
        append(
            &fixture.manager,
            Record::of("k2", "v").with_flag(Flags::POISON_PILL),
        )
        .await;
        append(&fixture.manager, Record::of("k3", "v")).await;

        let exit = tokio::time::timeout(Duration::from_secs(5), fixture.runner.run())
            .await
            .unwrap();
        assert_eq!(exit, RunnerExit::Completed);
        assert_eq!(fixture.processed.load(Ordering::SeqCst), 2);
        assert_eq!(
            fixture
                .manager
                .committed("forward", &LogPartition::of("in", 0)),
            2
        );
    }

    #[tokio::test]
    async fn test_interrupt() {
        let fixture = fixture().await;
        let task = tokio::spawn(fixture.runner.run());
        assert!(fixture.handle.wait_for_assignment(Duration::from_secs(1)).await);
        fixture.handle.interrupt();
        assert_eq!(task.await.unwrap(), RunnerExit::Interrupted);
        assert!(fixture.handle.is_terminated());
    }
}
