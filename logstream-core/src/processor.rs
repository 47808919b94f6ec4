//! Runs a whole [Topology]: one [ComputationPool] per computation, all reading and writing the
//! streams of a single [LogManager].
//!
//! ```text
//! LogStreamProcessor
//!   |-- pool (source)  -- runner, runner
//!   |-- pool (map)     -- runner
//!   `-- pool (sink)    -- runner, runner, runner
//! ```
//!
//! The pools are kept in topological order so that a drain goes from the sources to the sinks.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use backoff::retry::Retry;
use backoff::strategy::fixed;
use futures::future::join_all;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::Error;
use crate::Result;
use crate::config::Settings;
use crate::log::{Latency, LogManager, LogOffset, LogPartition};
use crate::pool::{ComputationPool, PoolComponents};
use crate::runner::RunnerShared;
use crate::topology::Topology;
use crate::watermark::Watermark;

pub mod assignments;

const CREATE_STREAM_RETRY_INTERVAL: u64 = 100; // ms
const CREATE_STREAM_RETRY_ATTEMPTS: usize = 3;

#[async_trait]
pub trait StreamProcessor: Send + Sync {
    /// Checks the settings against the topology, creates the missing streams and prepares the
    /// pools. Must be called once, before [StreamProcessor::start].
    async fn init(&mut self, topology: Topology, settings: Settings) -> Result<()>;

    fn start(&mut self) -> Result<()>;

    /// Returns false if some runners do not know their partitions after `timeout`.
    async fn wait_for_assignments(&self, timeout: Duration) -> bool;

    fn is_terminated(&self) -> bool;

    /// Stops all the computations at once. Returns false if they had to be shut down.
    async fn stop(&self, timeout: Duration) -> bool;

    /// Drains the computations from the sources to the sinks. Returns false if they had to be
    /// shut down.
    async fn drain_and_stop(&self, timeout: Duration) -> bool;

    async fn shutdown(&self);

    fn low_watermark(&self) -> u64;

    fn low_watermark_of(&self, computation: &str) -> u64;

    /// True when everything up to `timestamp` went through the whole topology.
    fn is_done(&self, timestamp: i64) -> bool;

    async fn latency(&self, computation: &str) -> Result<Latency>;

    fn failed_computations(&self) -> Vec<String>;
}

/// [StreamProcessor] over a [LogManager].
pub struct LogStreamProcessor {
    log_manager: Arc<dyn LogManager>,
    subscribe: bool,
    shared: Arc<RunnerShared>,
    topology: Option<Topology>,
    settings: Option<Arc<Settings>>,
    pools: Vec<ComputationPool>,
}

impl LogStreamProcessor {
    pub fn new(log_manager: Arc<dyn LogManager>) -> Self {
        Self {
            log_manager,
            subscribe: false,
            shared: Arc::new(RunnerShared::new()),
            topology: None,
            settings: None,
            pools: vec![],
        }
    }

    /// Lets the log assign the partitions dynamically instead of the round-robin assignment,
    /// ignored when the log does not support it.
    pub fn with_subscribe(mut self, subscribe: bool) -> Self {
        self.subscribe = subscribe;
        self
    }

    pub fn pools(&self) -> &[ComputationPool] {
        &self.pools
    }

    pub fn pool(&self, computation: &str) -> Option<&ComputationPool> {
        self.pools.iter().find(|p| p.name() == computation)
    }

    /// Settings once reconciled with the existing streams.
    pub fn settings(&self) -> Option<&Settings> {
        self.settings.as_deref()
    }

    fn topology(&self) -> Result<&Topology> {
        self.topology
            .as_ref()
            .ok_or_else(|| Error::Processor("processor is not initialized".to_string()))
    }

    /// An existing stream keeps its partitions, the settings are updated accordingly.
    async fn reconcile_partitions(&self, topology: &Topology, settings: &mut Settings) -> Result<()> {
        for stream in topology.streams() {
            if self.log_manager.exists(stream).await {
                let size = self.log_manager.size(stream).await?;
                if size != settings.partitions(stream) {
                    warn!(
                        stream,
                        existing = size,
                        expected = settings.partitions(stream),
                        "Using the existing partitions of the stream"
                    );
                }
                settings.set_partitions(stream, size);
                continue;
            }
            let partitions = settings.partitions(stream);
            let interval = fixed::Interval::from_millis(CREATE_STREAM_RETRY_INTERVAL)
                .take(CREATE_STREAM_RETRY_ATTEMPTS);
            let log_manager = &self.log_manager;
            Retry::new(
                interval,
                move || log_manager.create_if_not_exists(stream, partitions),
                |e: &Error| !matches!(e, Error::Config(_)),
            )
            .await?;
            info!(stream, partitions, "Stream created");
        }
        Ok(())
    }

    fn pool_low_watermark(&self, computation: &str) -> u64 {
        self.pool(computation)
            .map(ComputationPool::low_watermark)
            .unwrap_or_default()
    }

    async fn partition_latency(
        &self,
        settings: &Settings,
        computation: &str,
        partition: LogPartition,
        lower: u64,
        upper: u64,
    ) -> Result<Latency> {
        if upper <= lower {
            return Ok(Latency::default());
        }
        let codec = settings.codec(&partition.stream);
        // last appended record
        let Some(last) = self
            .log_manager
            .read_at(&LogOffset::new(partition.clone(), upper - 1))
            .await?
        else {
            return Ok(Latency::new(0, 0, upper - lower, None));
        };
        let last = codec.decode(&last.data)?;
        // last committed record, or the first one when nothing is committed yet
        let committed = self
            .log_manager
            .read_at(&LogOffset::new(partition, lower.saturating_sub(1)))
            .await?;
        let lower_ts = match committed {
            Some(record) => Watermark::of_value(codec.decode(&record.data)?.watermark()).timestamp(),
            None => 0,
        };
        let upper_ts = Watermark::of_value(last.watermark()).timestamp();
        let latency = Latency::new(lower_ts, upper_ts, upper - lower, last.key().map(String::from));
        debug!(computation, %latency, "Partition latency");
        Ok(latency)
    }
}

/// A computation reads all its inputs with one codec and writes all its outputs with one codec.
fn check_codecs(topology: &Topology, settings: &Settings) -> Result<()> {
    for computation in topology.computations() {
        let Some(metadata) = topology.metadata(computation) else {
            continue;
        };
        for (side, streams) in [
            ("input", metadata.input_streams()),
            ("output", metadata.output_streams()),
        ] {
            let codecs: BTreeSet<String> = streams
                .iter()
                .map(|s| settings.codec(s).name().to_string())
                .collect();
            if codecs.len() > 1 {
                return Err(Error::Config(format!(
                    "Different codecs for computation {computation} {side} streams: {codecs:?}"
                )));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl StreamProcessor for LogStreamProcessor {
    async fn init(&mut self, topology: Topology, mut settings: Settings) -> Result<()> {
        if self.topology.is_some() {
            return Err(Error::Processor("processor is already initialized".to_string()));
        }
        check_codecs(&topology, &settings)?;
        self.reconcile_partitions(&topology, &mut settings).await?;
        let settings = Arc::new(settings);

        let subscribe = self.subscribe && self.log_manager.supports_subscribe();
        if self.subscribe && !subscribe {
            warn!(log_manager = ?self.log_manager, "Subscribe is not supported, using the round-robin assignment");
        }

        let mut pools = vec![];
        for computation in topology.computations() {
            let (Some(metadata), Some(supplier)) =
                (topology.metadata(computation), topology.supplier(computation))
            else {
                return Err(Error::Processor(format!(
                    "computation {computation} is not in the topology"
                )));
            };
            let streams: Vec<(String, u16)> = metadata
                .input_streams()
                .iter()
                .map(|s| (s.clone(), settings.partitions(s)))
                .collect();
            let runners = settings.concurrency(computation);
            let assignments = assignments::round_robin(runners, &streams);
            info!(computation, runners, ?assignments, "Computation assignments");
            pools.push(ComputationPool::new(PoolComponents {
                metadata,
                supplier,
                assignments,
                log_manager: Arc::clone(&self.log_manager),
                settings: Arc::clone(&settings),
                subscribe,
                shared: Arc::clone(&self.shared),
            }));
        }
        self.pools = pools;
        self.topology = Some(topology);
        self.settings = Some(settings);
        Ok(())
    }

    fn start(&mut self) -> Result<()> {
        self.topology()?;
        info!(computations = self.pools.len(), "Starting processor");
        for pool in self.pools.iter_mut() {
            pool.start()?;
        }
        Ok(())
    }

    async fn wait_for_assignments(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        for pool in &self.pools {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if !pool.wait_for_assignments(remaining).await {
                return false;
            }
        }
        true
    }

    fn is_terminated(&self) -> bool {
        self.pools.iter().all(ComputationPool::is_terminated)
    }

    async fn stop(&self, timeout: Duration) -> bool {
        info!(?timeout, "Stopping processor");
        join_all(self.pools.iter().map(|p| p.stop(timeout)))
            .await
            .into_iter()
            .all(|stopped| stopped)
    }

    async fn drain_and_stop(&self, timeout: Duration) -> bool {
        info!(?timeout, "Draining processor");
        let deadline = Instant::now() + timeout;
        let mut drained = true;
        for pool in &self.pools {
            let remaining = deadline.saturating_duration_since(Instant::now());
            drained &= pool.drain_and_stop(remaining).await;
        }
        drained
    }

    async fn shutdown(&self) {
        info!("Shutting down processor");
        join_all(self.pools.iter().map(ComputationPool::shutdown)).await;
    }

    /// Minimum over the trees of the topology, a tree being a root computation and its
    /// descendants. Trees that processed nothing are ignored.
    fn low_watermark(&self) -> u64 {
        let Some(topology) = &self.topology else {
            return 0;
        };
        topology
            .roots()
            .into_iter()
            .map(|root| {
                std::iter::once(root)
                    .chain(topology.descendant_computations(root))
                    .map(|c| self.pool_low_watermark(c))
                    .min()
                    .unwrap_or_default()
            })
            .filter(|w| *w > 1)
            .min()
            .unwrap_or_default()
    }

    fn low_watermark_of(&self, computation: &str) -> u64 {
        let Some(topology) = &self.topology else {
            return 0;
        };
        topology
            .ancestor_computations(computation)
            .into_iter()
            .chain(std::iter::once(computation))
            .map(|c| self.pool_low_watermark(c))
            .min()
            .unwrap_or_default()
    }

    fn is_done(&self, timestamp: i64) -> bool {
        Watermark::of_value(self.low_watermark()).is_done(timestamp)
    }

    /// Worst latency over the input streams of the computation and of its ancestors.
    async fn latency(&self, computation: &str) -> Result<Latency> {
        let topology = self.topology()?;
        let settings = self
            .settings
            .as_deref()
            .ok_or_else(|| Error::Processor("processor is not initialized".to_string()))?;
        if topology.metadata(computation).is_none() {
            return Err(Error::Processor(format!(
                "unknown computation {computation}"
            )));
        }
        let mut latency = Latency::default();
        let computations: Vec<&str> = topology
            .ancestor_computations(computation)
            .into_iter()
            .chain(std::iter::once(computation))
            .collect();
        for name in computations {
            let Some(metadata) = topology.metadata(name) else {
                continue;
            };
            for stream in metadata.input_streams() {
                let lags = self.log_manager.lag_per_partition(stream, name).await?;
                for (partition, lag) in lags.into_iter().enumerate() {
                    let partition = LogPartition::of(stream.as_str(), partition as u16);
                    let partition_latency = self
                        .partition_latency(settings, name, partition, lag.lower, lag.upper)
                        .await?;
                    latency = latency.max(partition_latency);
                }
            }
        }
        Ok(latency)
    }

    fn failed_computations(&self) -> Vec<String> {
        self.shared.failed()
    }
}
