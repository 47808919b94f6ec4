#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use parking_lot::Mutex;
use tokio::time::Instant;

use logstream_core::codec::default_codec;
use logstream_core::log::LogPartition;
use logstream_core::{
    BatchComputation, BatchRunner, Computation, ComputationBase, ComputationContext,
    ComputationMetadata, ComputationSupplier, Error, LogManager, MemLogManager, Record, Result,
    Watermark,
};

/// Counts the callbacks a computation received, shared by all its instances.
#[derive(Debug, Default)]
pub struct Counters {
    pub inits: AtomicUsize,
    pub records: AtomicUsize,
    pub timers: AtomicUsize,
    pub retries: AtomicUsize,
    pub failures: AtomicUsize,
    pub stops: AtomicUsize,
}

impl Counters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn get(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

fn inc(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::SeqCst);
}

/// Forwards every record to `o1` and checkpoints after each of them. Records whose key is
/// `fail_on` always fail.
pub struct Forward {
    base: ComputationBase,
    counters: Arc<Counters>,
    fail_on: Option<String>,
}

pub fn forward(name: &'static str, counters: &Arc<Counters>) -> ComputationSupplier {
    forward_failing_on(name, counters, None)
}

pub fn forward_failing_on(
    name: &'static str,
    counters: &Arc<Counters>,
    fail_on: Option<&'static str>,
) -> ComputationSupplier {
    let counters = Arc::clone(counters);
    Arc::new(move || -> Box<dyn Computation> {
        Box::new(Forward {
            base: ComputationBase::new(name, 1, 1).unwrap(),
            counters: Arc::clone(&counters),
            fail_on: fail_on.map(String::from),
        })
    })
}

#[async_trait]
impl Computation for Forward {
    fn metadata(&self) -> &ComputationMetadata {
        self.base.metadata()
    }

    async fn init(&mut self, _context: &mut ComputationContext) -> Result<()> {
        inc(&self.counters.inits);
        Ok(())
    }

    async fn process_record(
        &mut self,
        context: &mut ComputationContext,
        _input_stream: &str,
        record: Record,
    ) -> Result<()> {
        inc(&self.counters.records);
        if self.fail_on.is_some() && record.key() == self.fail_on.as_deref() {
            return Err(Error::Computation(format!("cannot process {record}")));
        }
        context.produce_record("o1", record)?;
        context.ask_for_checkpoint();
        Ok(())
    }

    async fn process_retry(&mut self, _context: &mut ComputationContext, _failure: &Error) {
        inc(&self.counters.retries);
    }

    async fn process_failure(&mut self, _context: &mut ComputationContext, _failure: &Error) {
        inc(&self.counters.failures);
    }

    fn signal_stop(&mut self) {
        inc(&self.counters.stops);
    }
}

/// Sink failing on every record.
pub struct AlwaysFailing {
    base: ComputationBase,
    counters: Arc<Counters>,
}

pub fn always_failing(name: &'static str, counters: &Arc<Counters>) -> ComputationSupplier {
    let counters = Arc::clone(counters);
    Arc::new(move || -> Box<dyn Computation> {
        Box::new(AlwaysFailing {
            base: ComputationBase::new(name, 1, 0).unwrap(),
            counters: Arc::clone(&counters),
        })
    })
}

#[async_trait]
impl Computation for AlwaysFailing {
    fn metadata(&self) -> &ComputationMetadata {
        self.base.metadata()
    }

    async fn process_record(
        &mut self,
        _context: &mut ComputationContext,
        _input_stream: &str,
        _record: Record,
    ) -> Result<()> {
        inc(&self.counters.records);
        Err(Error::Computation("always failing".to_string()))
    }

    async fn process_retry(&mut self, _context: &mut ComputationContext, _failure: &Error) {
        inc(&self.counters.retries);
    }

    async fn process_failure(&mut self, _context: &mut ComputationContext, _failure: &Error) {
        inc(&self.counters.failures);
    }
}

/// Sink counting its records without ever asking for a checkpoint.
pub struct Sink {
    base: ComputationBase,
    counters: Arc<Counters>,
}

pub fn sink(name: &'static str, counters: &Arc<Counters>) -> ComputationSupplier {
    let counters = Arc::clone(counters);
    Arc::new(move || -> Box<dyn Computation> {
        Box::new(Sink {
            base: ComputationBase::new(name, 1, 0).unwrap(),
            counters: Arc::clone(&counters),
        })
    })
}

#[async_trait]
impl Computation for Sink {
    fn metadata(&self) -> &ComputationMetadata {
        self.base.metadata()
    }

    async fn process_record(
        &mut self,
        _context: &mut ComputationContext,
        _input_stream: &str,
        _record: Record,
    ) -> Result<()> {
        inc(&self.counters.records);
        Ok(())
    }
}

/// Sink that never returns from `process_record`.
pub struct Stuck(ComputationBase);

pub fn stuck(name: &'static str) -> ComputationSupplier {
    Arc::new(move || -> Box<dyn Computation> {
        Box::new(Stuck(ComputationBase::new(name, 1, 0).unwrap()))
    })
}

#[async_trait]
impl Computation for Stuck {
    fn metadata(&self) -> &ComputationMetadata {
        self.0.metadata()
    }

    async fn process_record(
        &mut self,
        _context: &mut ComputationContext,
        _input_stream: &str,
        _record: Record,
    ) -> Result<()> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(())
    }
}

/// Source producing `count` records to `o1`, one per timer, then going quiet.
pub struct TimerSource {
    base: ComputationBase,
    counters: Arc<Counters>,
    count: usize,
    produced: usize,
}

const TIMER_GENERATE: &str = "generate";

pub fn timer_source(
    name: &'static str,
    count: usize,
    counters: &Arc<Counters>,
) -> ComputationSupplier {
    let counters = Arc::clone(counters);
    Arc::new(move || -> Box<dyn Computation> {
        Box::new(TimerSource {
            base: ComputationBase::new(name, 0, 1).unwrap(),
            counters: Arc::clone(&counters),
            count,
            produced: 0,
        })
    })
}

#[async_trait]
impl Computation for TimerSource {
    fn metadata(&self) -> &ComputationMetadata {
        self.base.metadata()
    }

    async fn init(&mut self, context: &mut ComputationContext) -> Result<()> {
        inc(&self.counters.inits);
        context.set_timer(TIMER_GENERATE, Utc::now().timestamp_millis());
        Ok(())
    }

    async fn process_record(
        &mut self,
        _context: &mut ComputationContext,
        _input_stream: &str,
        _record: Record,
    ) -> Result<()> {
        Err(Error::Computation("a source has no input".to_string()))
    }

    async fn process_timer(
        &mut self,
        context: &mut ComputationContext,
        _key: &str,
        timestamp: i64,
    ) -> Result<()> {
        inc(&self.counters.timers);
        let watermark = Watermark::of_timestamp(timestamp)?.value();
        context.produce_record(
            "o1",
            Record::of(format!("key-{}", self.produced), "generated").with_watermark(watermark),
        )?;
        context.set_source_low_watermark(watermark);
        context.ask_for_checkpoint();
        self.produced += 1;
        if self.produced < self.count {
            context.set_timer(TIMER_GENERATE, Utc::now().timestamp_millis() + 10);
        }
        Ok(())
    }
}

/// Records the size of every batch it receives.
pub struct CollectBatches {
    base: ComputationBase,
    batches: Arc<Mutex<Vec<usize>>>,
}

pub fn collect_batches(name: &'static str, batches: &Arc<Mutex<Vec<usize>>>) -> ComputationSupplier {
    let batches = Arc::clone(batches);
    Arc::new(move || -> Box<dyn Computation> {
        Box::new(BatchRunner::new(CollectBatches {
            base: ComputationBase::new(name, 1, 0).unwrap(),
            batches: Arc::clone(&batches),
        }))
    })
}

#[async_trait]
impl BatchComputation for CollectBatches {
    fn metadata(&self) -> &ComputationMetadata {
        self.base.metadata()
    }

    async fn batch_process(
        &mut self,
        _context: &mut ComputationContext,
        _input_stream: &str,
        records: &[Record],
    ) -> Result<()> {
        self.batches.lock().push(records.len());
        Ok(())
    }

    async fn batch_failure(
        &mut self,
        _context: &mut ComputationContext,
        _input_stream: &str,
        _records: &[Record],
    ) {
    }
}

/// Appends records encoded with the default codec.
pub async fn append(manager: &MemLogManager, stream: &str, partition: u16, records: Vec<Record>) {
    let codec = default_codec();
    for record in records {
        let data: Bytes = codec.encode(&record).unwrap();
        manager.append(stream, partition, data).await.unwrap();
    }
}

pub fn records(keys: &[&str]) -> Vec<Record> {
    keys.iter().map(|k| Record::of(*k, "value")).collect()
}

pub fn committed(manager: &MemLogManager, group: &str, stream: &str, partition: u16) -> u64 {
    manager.committed(group, &LogPartition::of(stream, partition))
}

/// Polls `condition` until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
