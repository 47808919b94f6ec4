//! Prometheus metrics of the runners, kept in a process wide registry and exposed through
//! [encode_metrics].

use std::sync::OnceLock;

use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{Histogram, exponential_buckets_range};
use prometheus_client::registry::Registry;

use crate::Error;
use crate::Result;

// The top-level metric registry is created with the GLOBAL_PREFIX
const REGISTRY_GLOBAL_PREFIX: &str = "logstream";

const COMPUTATION_LABEL: &str = "computation";
const STREAM_LABEL: &str = "stream";

const RECORDS_TOTAL: &str = "records";
const TIMERS_TOTAL: &str = "timers";
const RETRIES_TOTAL: &str = "retries";
const SKIPPED_FAILURES_TOTAL: &str = "skipped_failures";
const FAILURES_TOTAL: &str = "failures";
const CHECKPOINTS_TOTAL: &str = "checkpoints";
const CHECKPOINT_FAILURES_TOTAL: &str = "checkpoint_failures";
const APPENDED_TOTAL: &str = "appended";
const RUNNERS: &str = "runners";
const LOW_WATERMARK: &str = "low_watermark";
const PROCESSING_TIME: &str = "processing_time";
const CHECKPOINT_TIME: &str = "checkpoint_time";

/// GlobalRegistry is a wrapper around the prometheus Registry, guarded by a lock so that the
/// metrics can be registered lazily and encoded from any task.
struct GlobalRegistry {
    registry: parking_lot::Mutex<Registry>,
}

/// GLOBAL_REGISTRY is the static global registry which is initialized only once.
static GLOBAL_REGISTRY: OnceLock<GlobalRegistry> = OnceLock::new();

fn global_registry() -> &'static GlobalRegistry {
    GLOBAL_REGISTRY.get_or_init(|| GlobalRegistry {
        registry: parking_lot::Mutex::new(Registry::default()),
    })
}

/// Metrics of the computation runners. Every family is labeled with the computation name and,
/// for the stream related ones, the stream name.
pub(crate) struct RunnerMetrics {
    pub(crate) records: Family<Vec<(String, String)>, Counter>,
    pub(crate) timers: Family<Vec<(String, String)>, Counter>,
    pub(crate) retries: Family<Vec<(String, String)>, Counter>,
    pub(crate) skipped_failures: Family<Vec<(String, String)>, Counter>,
    pub(crate) failures: Family<Vec<(String, String)>, Counter>,
    pub(crate) checkpoints: Family<Vec<(String, String)>, Counter>,
    pub(crate) checkpoint_failures: Family<Vec<(String, String)>, Counter>,
    pub(crate) appended: Family<Vec<(String, String)>, Counter>,
    pub(crate) runners: Family<Vec<(String, String)>, Gauge>,
    pub(crate) low_watermark: Family<Vec<(String, String)>, Gauge>,
    pub(crate) processing_time: Family<Vec<(String, String)>, Histogram>,
    pub(crate) checkpoint_time: Family<Vec<(String, String)>, Histogram>,
}

impl RunnerMetrics {
    fn new() -> Self {
        let metrics = Self {
            records: Family::default(),
            timers: Family::default(),
            retries: Family::default(),
            skipped_failures: Family::default(),
            failures: Family::default(),
            checkpoints: Family::default(),
            checkpoint_failures: Family::default(),
            appended: Family::default(),
            runners: Family::default(),
            low_watermark: Family::default(),
            processing_time: Family::<Vec<(String, String)>, Histogram>::new_with_constructor(
                || Histogram::new(exponential_buckets_range(100.0, 60_000_000.0, 10)),
            ),
            checkpoint_time: Family::<Vec<(String, String)>, Histogram>::new_with_constructor(
                || Histogram::new(exponential_buckets_range(100.0, 60_000_000.0, 10)),
            ),
        };

        let mut registry = global_registry().registry.lock();
        let registry = registry.sub_registry_with_prefix(REGISTRY_GLOBAL_PREFIX);
        // counters
        registry.register(
            RECORDS_TOTAL,
            "A Counter to keep track of the records processed by a computation, per input stream",
            metrics.records.clone(),
        );
        registry.register(
            TIMERS_TOTAL,
            "A Counter to keep track of the timers fired on a computation",
            metrics.timers.clone(),
        );
        registry.register(
            RETRIES_TOTAL,
            "A Counter to keep track of the processing retries of a computation",
            metrics.retries.clone(),
        );
        registry.register(
            SKIPPED_FAILURES_TOTAL,
            "A Counter to keep track of the failures skipped by a computation",
            metrics.skipped_failures.clone(),
        );
        registry.register(
            FAILURES_TOTAL,
            "A Counter to keep track of the failures that terminated a computation",
            metrics.failures.clone(),
        );
        registry.register(
            CHECKPOINTS_TOTAL,
            "A Counter to keep track of the checkpoints done by a computation",
            metrics.checkpoints.clone(),
        );
        registry.register(
            CHECKPOINT_FAILURES_TOTAL,
            "A Counter to keep track of the failed checkpoints of a computation",
            metrics.checkpoint_failures.clone(),
        );
        registry.register(
            APPENDED_TOTAL,
            "A Counter to keep track of the records appended to a stream",
            metrics.appended.clone(),
        );
        // gauges
        registry.register(
            RUNNERS,
            "A Gauge to keep track of the running runners of a computation",
            metrics.runners.clone(),
        );
        registry.register(
            LOW_WATERMARK,
            "A Gauge with the low watermark timestamp (ms) of a computation",
            metrics.low_watermark.clone(),
        );
        // timers
        registry.register(
            PROCESSING_TIME,
            "A Histogram to keep track of the time taken to process a record, in microseconds",
            metrics.processing_time.clone(),
        );
        registry.register(
            CHECKPOINT_TIME,
            "A Histogram to keep track of the time taken by a checkpoint, in microseconds",
            metrics.checkpoint_time.clone(),
        );
        metrics
    }
}

static RUNNER_METRICS: OnceLock<RunnerMetrics> = OnceLock::new();

pub(crate) fn runner_metrics() -> &'static RunnerMetrics {
    RUNNER_METRICS.get_or_init(RunnerMetrics::new)
}

pub(crate) fn computation_labels(computation: &str) -> Vec<(String, String)> {
    vec![(COMPUTATION_LABEL.to_string(), computation.to_string())]
}

pub(crate) fn stream_labels(computation: &str, stream: &str) -> Vec<(String, String)> {
    vec![
        (COMPUTATION_LABEL.to_string(), computation.to_string()),
        (STREAM_LABEL.to_string(), stream.to_string()),
    ]
}

/// Text exposition of every registered metric.
pub fn encode_metrics() -> Result<String> {
    // make sure the families exist even before the first runner starts
    runner_metrics();
    let registry = global_registry().registry.lock();
    let mut buffer = String::new();
    encode(&mut buffer, &registry)
        .map_err(|e| Error::Processor(format!("failed to encode metrics: {e}")))?;
    Ok(buffer)
}
