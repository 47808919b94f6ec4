//! Batching on top of [Computation]: records are accumulated and handed over in batches.
//!
//! A batch only holds consecutive records of a single input stream. It is flushed when it
//! reaches the policy's batch capacity, when the threshold timer fires, or when a record comes
//! from another input stream. Every successful flush asks for a checkpoint.

use async_trait::async_trait;
use chrono::Utc;
use tracing::warn;

use crate::Error;
use crate::Result;
use crate::computation::{Computation, ComputationContext, ComputationMetadata};
use crate::record::Record;

const TIMER_BATCH: &str = "batch";

#[async_trait]
pub trait BatchComputation: Send {
    fn metadata(&self) -> &ComputationMetadata;

    async fn init(&mut self, _context: &mut ComputationContext) -> Result<()> {
        Ok(())
    }

    async fn batch_process(
        &mut self,
        context: &mut ComputationContext,
        input_stream: &str,
        records: &[Record],
    ) -> Result<()>;

    /// Called with the batch that could not be processed, the batch is discarded afterwards.
    async fn batch_failure(
        &mut self,
        context: &mut ComputationContext,
        input_stream: &str,
        records: &[Record],
    );

    async fn destroy(&mut self) {}
}

/// Adapts a [BatchComputation] into a [Computation].
pub struct BatchRunner<B> {
    inner: B,
    batch: Vec<Record>,
    input_stream: Option<String>,
    /// Record that triggered a failed capacity flush. It is not part of the batch anymore
    /// because a retry hands it over again.
    in_flight: Option<Record>,
}

impl<B: BatchComputation> BatchRunner<B> {
    pub fn new(inner: B) -> Self {
        Self {
            inner,
            batch: vec![],
            input_stream: None,
            in_flight: None,
        }
    }

    pub fn inner(&self) -> &B {
        &self.inner
    }

    fn arm_timer(context: &mut ComputationContext) {
        let due = Utc::now().timestamp_millis() + context.policy().batch_threshold().as_millis() as i64;
        context.set_timer(TIMER_BATCH, due);
    }

    async fn flush(&mut self, context: &mut ComputationContext) -> Result<()> {
        let Some(input_stream) = self.input_stream.clone() else {
            return Ok(());
        };
        if self.batch.is_empty() {
            return Ok(());
        }
        self.inner
            .batch_process(context, &input_stream, &self.batch)
            .await?;
        self.batch.clear();
        context.ask_for_checkpoint();
        Ok(())
    }
}

#[async_trait]
impl<B: BatchComputation> Computation for BatchRunner<B> {
    fn metadata(&self) -> &ComputationMetadata {
        self.inner.metadata()
    }

    async fn init(&mut self, context: &mut ComputationContext) -> Result<()> {
        // a new assignment replays everything not checkpointed
        self.batch.clear();
        self.input_stream = None;
        self.in_flight = None;
        Self::arm_timer(context);
        self.inner.init(context).await
    }

    async fn process_record(
        &mut self,
        context: &mut ComputationContext,
        input_stream: &str,
        record: Record,
    ) -> Result<()> {
        self.in_flight = None;
        if self.input_stream.as_deref() != Some(input_stream) {
            self.flush(context).await?;
            self.input_stream = Some(input_stream.to_string());
        }
        self.batch.push(record);
        if self.batch.len() >= context.policy().batch_capacity() {
            if let Err(e) = self.flush(context).await {
                self.in_flight = self.batch.pop();
                return Err(e);
            }
        }
        Ok(())
    }

    async fn process_timer(
        &mut self,
        context: &mut ComputationContext,
        key: &str,
        _timestamp: i64,
    ) -> Result<()> {
        if key != TIMER_BATCH {
            return Ok(());
        }
        self.flush(context).await?;
        Self::arm_timer(context);
        Ok(())
    }

    async fn process_retry(&mut self, _context: &mut ComputationContext, failure: &Error) {
        warn!(
            computation = %self.inner.metadata().name(),
            batch = self.batch.len(),
            ?failure,
            "Retrying batch"
        );
    }

    async fn process_failure(&mut self, context: &mut ComputationContext, failure: &Error) {
        warn!(
            computation = %self.inner.metadata().name(),
            batch = self.batch.len(),
            ?failure,
            "Batch failure"
        );
        let mut records = std::mem::take(&mut self.batch);
        records.extend(self.in_flight.take());
        let input_stream = self.input_stream.clone().unwrap_or_default();
        self.inner
            .batch_failure(context, &input_stream, &records)
            .await;
        Self::arm_timer(context);
    }

    async fn destroy(&mut self) {
        self.inner.destroy().await;
    }
}
