use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio_util::sync::CancellationToken;

use crate::Error;
use crate::Result;
use crate::computation::ComputationMetadataMapping;
use crate::config::ComputationPolicy;
use crate::log::{LogOffset, LogPartition};
use crate::record::Record;

/// What a computation can do while processing: produce records, schedule timers and drive the
/// checkpoints of its runner.
///
/// Produced records are buffered and only appended to the log on the next checkpoint. A new
/// context is created on every partition assignment, anything not checkpointed is lost.
#[derive(Debug)]
pub struct ComputationContext {
    metadata: Arc<ComputationMetadataMapping>,
    policy: ComputationPolicy,
    partitions: Vec<LogPartition>,
    spare: bool,
    stop_token: CancellationToken,
    /// physical output stream -> records in production order
    records: HashMap<String, Vec<Record>>,
    /// key -> due time in ms since epoch
    timers: HashMap<String, i64>,
    checkpoint_requested: bool,
    termination_requested: bool,
    source_low_watermark: u64,
    last_offset: Option<LogOffset>,
}

impl ComputationContext {
    pub fn new(
        metadata: Arc<ComputationMetadataMapping>,
        policy: ComputationPolicy,
        partitions: Vec<LogPartition>,
        stop_token: CancellationToken,
    ) -> Self {
        let spare = !metadata.is_source() && partitions.is_empty();
        Self {
            metadata,
            policy,
            partitions,
            spare,
            stop_token,
            records: HashMap::new(),
            timers: HashMap::new(),
            checkpoint_requested: false,
            termination_requested: false,
            source_low_watermark: 0,
            last_offset: None,
        }
    }

    /// Buffers a record for an output stream, given by its logical (`o1`) or physical name.
    pub fn produce_record(&mut self, stream: &str, record: Record) -> Result<()> {
        let physical = self.metadata.output_stream(stream).ok_or_else(|| {
            Error::Computation(format!(
                "computation {} has no output stream {stream}",
                self.metadata.name()
            ))
        })?;
        self.records
            .entry(physical.to_string())
            .or_default()
            .push(record);
        Ok(())
    }

    pub fn produce_record_key(
        &mut self,
        stream: &str,
        key: impl Into<String>,
        payload: impl Into<Bytes>,
    ) -> Result<()> {
        self.produce_record(stream, Record::of(key, payload))
    }

    /// Schedules `process_timer(key)` at `timestamp` (ms since epoch), replacing any previous
    /// timer with the same key.
    pub fn set_timer(&mut self, key: impl Into<String>, timestamp: i64) {
        self.timers.insert(key.into(), timestamp);
    }

    pub fn remove_timer(&mut self, key: &str) -> Option<i64> {
        self.timers.remove(key)
    }

    pub fn timers(&self) -> &HashMap<String, i64> {
        &self.timers
    }

    pub fn ask_for_checkpoint(&mut self) {
        self.checkpoint_requested = true;
    }

    pub fn cancel_ask_for_checkpoint(&mut self) {
        self.checkpoint_requested = false;
    }

    pub fn need_checkpoint(&self) -> bool {
        self.checkpoint_requested
    }

    /// Lets a source computation advance its low watermark without consuming records.
    pub fn set_source_low_watermark(&mut self, watermark: u64) {
        self.source_low_watermark = watermark;
    }

    pub fn source_low_watermark(&self) -> u64 {
        self.source_low_watermark
    }

    /// The runner stops at the end of the current iteration.
    pub fn ask_for_termination(&mut self) {
        self.termination_requested = true;
    }

    pub fn requires_termination(&self) -> bool {
        self.termination_requested
    }

    /// Offset of the last record read by the runner.
    pub fn last_offset(&self) -> Option<&LogOffset> {
        self.last_offset.as_ref()
    }

    pub fn policy(&self) -> &ComputationPolicy {
        &self.policy
    }

    /// True for a runner with input streams but no partition to read.
    pub fn is_spare_computation(&self) -> bool {
        self.spare
    }

    pub fn assigned_partitions(&self) -> &[LogPartition] {
        &self.partitions
    }

    pub fn metadata(&self) -> &ComputationMetadataMapping {
        &self.metadata
    }

    /// Cancelled as soon as the runner is asked to stop, can be awaited from a long running
    /// hook.
    pub fn stop_token(&self) -> &CancellationToken {
        &self.stop_token
    }

    /// Records produced since the last checkpoint, per physical stream.
    pub fn records(&self) -> &HashMap<String, Vec<Record>> {
        &self.records
    }

    pub(crate) fn take_records(&mut self) -> HashMap<String, Vec<Record>> {
        std::mem::take(&mut self.records)
    }

    pub(crate) fn set_last_offset(&mut self, offset: LogOffset) {
        self.last_offset = Some(offset);
    }

    /// Timers due at `now`, oldest first.
    pub(crate) fn due_timers(&self, now: i64) -> Vec<(String, i64)> {
        let mut due: Vec<(String, i64)> = self
            .timers
            .iter()
            .filter(|(_, ts)| **ts <= now)
            .map(|(key, ts)| (key.clone(), *ts))
            .collect();
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
        due
    }
}
