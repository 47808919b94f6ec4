//! The partitioned log consumed and produced by the computations.
//!
//! A stream is split in a fixed number of partitions. Consumers read through a [LogTailer] that
//! belongs to a consumer group: each group has its own committed offset per partition, and a
//! partition is read by at most one tailer of a group at a time.

use std::cmp::Ordering;
use std::fmt::{self, Debug};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;

use crate::Result;

pub mod memory;

pub use memory::MemLogManager;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LogPartition {
    pub stream: String,
    pub partition: u16,
}

impl LogPartition {
    pub fn of(stream: impl Into<String>, partition: u16) -> Self {
        Self {
            stream: stream.into(),
            partition,
        }
    }
}

impl fmt::Display for LogPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}", self.stream, self.partition)
    }
}

/// Position of a record inside a partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LogOffset {
    pub partition: LogPartition,
    pub offset: u64,
}

impl LogOffset {
    pub fn new(partition: LogPartition, offset: u64) -> Self {
        Self { partition, offset }
    }
}

impl fmt::Display for LogOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:+{}", self.partition, self.offset)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRecord {
    pub offset: LogOffset,
    pub data: Bytes,
}

/// Distance between the committed offset of a group (`lower`) and the end of the log (`upper`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LogLag {
    pub lower: u64,
    pub upper: u64,
    pub lag: u64,
}

impl LogLag {
    pub fn new(lower: u64, upper: u64) -> Self {
        Self {
            lower,
            upper,
            lag: upper.saturating_sub(lower),
        }
    }

    /// Aggregated lag of several partitions.
    pub fn sum<'a>(lags: impl IntoIterator<Item = &'a LogLag>) -> LogLag {
        lags.into_iter().fold(LogLag::default(), |acc, l| LogLag {
            lower: acc.lower + l.lower,
            upper: acc.upper + l.upper,
            lag: acc.lag + l.lag,
        })
    }
}

/// Processing latency of a computation on one of its inputs, computed from the watermark of the
/// last committed record (`lower`) and of the last appended record (`upper`).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Latency {
    pub lower: i64,
    pub upper: i64,
    pub lag: u64,
    pub key: Option<String>,
}

impl Latency {
    pub fn new(lower: i64, upper: i64, lag: u64, key: Option<String>) -> Self {
        Self {
            lower,
            upper,
            lag,
            key,
        }
    }

    pub fn of(lower: i64, upper: i64, lag: LogLag, key: Option<String>) -> Self {
        Self::new(lower, upper, lag.lag, key)
    }

    /// Latency in milliseconds, 0 when one of the bounds is unknown.
    pub fn latency(&self) -> i64 {
        if self.lower == 0 || self.upper == 0 {
            return 0;
        }
        (self.upper - self.lower).max(0)
    }

    /// Keeps the worst of two latencies: the largest latency then the largest lag.
    pub fn max(self, other: Latency) -> Latency {
        match self
            .latency()
            .cmp(&other.latency())
            .then(self.lag.cmp(&other.lag))
        {
            Ordering::Less => other,
            _ => self,
        }
    }
}

impl fmt::Display for Latency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Latency{{lat={}ms, lag={}, key={}}}",
            self.latency(),
            self.lag,
            self.key.as_deref().unwrap_or_default()
        )
    }
}

/// Notified by a subscribed tailer when its partitions change. Callbacks run on the task that
/// reads the tailer, before the read returns.
pub trait RebalanceListener: Send + Sync {
    fn on_partitions_revoked(&self, partitions: &[LogPartition]);

    fn on_partitions_assigned(&self, partitions: &[LogPartition]);
}

#[async_trait]
pub trait LogManager: Send + Sync + Debug {
    async fn exists(&self, stream: &str) -> bool;

    /// Returns true if the stream has been created.
    async fn create_if_not_exists(&self, stream: &str, partitions: u16) -> Result<bool>;

    /// Number of partitions of the stream.
    async fn size(&self, stream: &str) -> Result<u16>;

    async fn append(&self, stream: &str, partition: u16, data: Bytes) -> Result<LogOffset>;

    /// Tailer reading an explicit set of partitions, positioned on the group's committed offsets.
    async fn create_tailer(
        &self,
        group: &str,
        partitions: Vec<LogPartition>,
    ) -> Result<Box<dyn LogTailer>>;

    fn supports_subscribe(&self) -> bool;

    /// Tailer whose partitions are assigned dynamically among the subscribers of the group.
    async fn subscribe(
        &self,
        group: &str,
        streams: Vec<String>,
        listener: Arc<dyn RebalanceListener>,
    ) -> Result<Box<dyn LogTailer>>;

    async fn lag(&self, stream: &str, group: &str) -> Result<LogLag> {
        let lags = self.lag_per_partition(stream, group).await?;
        Ok(LogLag::sum(&lags))
    }

    async fn lag_per_partition(&self, stream: &str, group: &str) -> Result<Vec<LogLag>>;

    async fn read_at(&self, offset: &LogOffset) -> Result<Option<LogRecord>>;
}

#[async_trait]
pub trait LogTailer: Send + Debug {
    /// Next record of the assigned partitions, waiting at most `timeout`.
    async fn read(&mut self, timeout: Duration) -> Result<Option<LogRecord>>;

    /// Commits the read positions of all the assigned partitions.
    async fn commit(&mut self) -> Result<()>;

    fn assignments(&self) -> Vec<LogPartition>;

    fn group(&self) -> &str;

    /// Moves back to the committed offsets, the records read since are read again.
    async fn to_last_committed(&mut self) -> Result<()>;

    async fn close(&mut self) -> Result<()>;
}

/// Partition of a record in a stream: a stable hash of the key.
pub fn partition_of(key: Option<&str>, partitions: u16) -> u16 {
    if partitions <= 1 {
        return 0;
    }
    let hash = key.map_or(0_i32, |k| {
        k.encode_utf16()
            .fold(0_i32, |h, c| h.wrapping_mul(31).wrapping_add(i32::from(c)))
    });
    ((hash & i32::MAX) % i32::from(partitions)) as u16
}
