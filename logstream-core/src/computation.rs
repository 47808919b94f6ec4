//! The user extension point: a [Computation] consumes records from its input streams and
//! produces records on its output streams through a [ComputationContext].
//!
//! Lifecycle of a computation instance, driven by its runner:
//!
//! ```text
//! created -> init -> running <-> reassigning (init again) -> stopping -> destroyed
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, warn};

use crate::Error;
use crate::Result;
use crate::record::Record;

pub mod batch;
pub mod context;

pub use batch::{BatchComputation, BatchRunner};
pub use context::ComputationContext;

/// Creates a new computation instance, one per runner.
pub type ComputationSupplier = Arc<dyn Fn() -> Box<dyn Computation> + Send + Sync>;

/// Name and streams of a computation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputationMetadata {
    name: String,
    input_streams: BTreeSet<String>,
    output_streams: BTreeSet<String>,
}

impl ComputationMetadata {
    pub fn new<I, O>(name: impl Into<String>, input_streams: I, output_streams: O) -> Result<Self>
    where
        I: IntoIterator,
        I::Item: Into<String>,
        O: IntoIterator,
        O::Item: Into<String>,
    {
        let name = name.into();
        let input_streams: BTreeSet<String> = input_streams.into_iter().map(Into::into).collect();
        let output_streams: BTreeSet<String> =
            output_streams.into_iter().map(Into::into).collect();
        if input_streams.is_empty() && output_streams.is_empty() {
            return Err(Error::Config(format!(
                "computation {name} has no input nor output stream"
            )));
        }
        Ok(Self {
            name,
            input_streams,
            output_streams,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn input_streams(&self) -> &BTreeSet<String> {
        &self.input_streams
    }

    pub fn output_streams(&self) -> &BTreeSet<String> {
        &self.output_streams
    }

    /// A computation without input generates records from its timers.
    pub fn is_source(&self) -> bool {
        self.input_streams.is_empty()
    }
}

/// Metadata of a computation placed in a topology: its logical stream names (`i1`, `o1`, ...)
/// are bound to physical stream names. The streams exposed by this type are the physical ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ComputationMetadataMapping {
    metadata: ComputationMetadata,
    /// logical -> physical
    map: HashMap<String, String>,
    /// physical -> logical
    reverse: HashMap<String, String>,
}

impl ComputationMetadataMapping {
    /// Streams not present in `mapping` keep their name.
    pub fn new(metadata: &ComputationMetadata, mapping: &HashMap<String, String>) -> Result<Self> {
        let declared: BTreeSet<&String> = metadata
            .input_streams
            .iter()
            .chain(metadata.output_streams.iter())
            .collect();
        if let Some(unknown) = mapping.keys().find(|k| !declared.contains(k)) {
            return Err(Error::Config(format!(
                "computation {} has no stream named {unknown}",
                metadata.name
            )));
        }
        let mut map = HashMap::new();
        let mut reverse = HashMap::new();
        for logical in declared {
            let physical = mapping.get(logical).unwrap_or(logical);
            map.insert(logical.clone(), physical.clone());
            reverse.insert(physical.clone(), logical.clone());
        }
        let physical = |streams: &BTreeSet<String>| -> BTreeSet<String> {
            streams
                .iter()
                .map(|s| map.get(s).cloned().unwrap_or_else(|| s.clone()))
                .collect()
        };
        let mapped = ComputationMetadata {
            name: metadata.name.clone(),
            input_streams: physical(&metadata.input_streams),
            output_streams: physical(&metadata.output_streams),
        };
        Ok(Self {
            metadata: mapped,
            map,
            reverse,
        })
    }

    pub fn name(&self) -> &str {
        self.metadata.name()
    }

    pub fn input_streams(&self) -> &BTreeSet<String> {
        self.metadata.input_streams()
    }

    pub fn output_streams(&self) -> &BTreeSet<String> {
        self.metadata.output_streams()
    }

    pub fn is_source(&self) -> bool {
        self.metadata.is_source()
    }

    /// Physical name of a logical stream.
    pub fn map(&self, logical: &str) -> Option<&str> {
        self.map.get(logical).map(String::as_str)
    }

    /// Logical name of a physical stream.
    pub fn reverse_map(&self, physical: &str) -> Option<&str> {
        self.reverse.get(physical).map(String::as_str)
    }

    /// Physical output stream for a logical or physical name.
    pub(crate) fn output_stream(&self, name: &str) -> Option<&str> {
        if let Some(stream) = self.metadata.output_streams.get(name) {
            return Some(stream.as_str());
        }
        self.map(name)
            .filter(|physical| self.metadata.output_streams.contains(*physical))
    }
}

impl fmt::Display for ComputationMetadataMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}(in: {:?}, out: {:?})",
            self.name(),
            self.input_streams(),
            self.output_streams()
        )
    }
}

/// Holds the metadata of a computation using the `i1..iN` / `o1..oN` naming convention, to be
/// embedded in [Computation] implementations.
#[derive(Debug, Clone)]
pub struct ComputationBase {
    metadata: ComputationMetadata,
}

impl ComputationBase {
    pub fn new(name: impl Into<String>, nb_inputs: usize, nb_outputs: usize) -> Result<Self> {
        let metadata = ComputationMetadata::new(
            name,
            (1..=nb_inputs).map(|i| format!("i{i}")),
            (1..=nb_outputs).map(|i| format!("o{i}")),
        )?;
        Ok(Self { metadata })
    }

    pub fn metadata(&self) -> &ComputationMetadata {
        &self.metadata
    }

    pub fn name(&self) -> &str {
        self.metadata.name()
    }
}

/// A computation instance is owned by a single runner, so `&mut self` is never shared.
#[async_trait]
pub trait Computation: Send {
    fn metadata(&self) -> &ComputationMetadata;

    /// Called on each (re)assignment of partitions, with a fresh context.
    async fn init(&mut self, _context: &mut ComputationContext) -> Result<()> {
        Ok(())
    }

    /// `input_stream` is the logical name of the stream the record comes from.
    async fn process_record(
        &mut self,
        context: &mut ComputationContext,
        input_stream: &str,
        record: Record,
    ) -> Result<()>;

    async fn process_timer(
        &mut self,
        _context: &mut ComputationContext,
        _key: &str,
        _timestamp: i64,
    ) -> Result<()> {
        Ok(())
    }

    /// Called before retrying a failed record or timer.
    async fn process_retry(&mut self, _context: &mut ComputationContext, failure: &Error) {
        warn!(computation = %self.metadata().name(), ?failure, "Retrying after failure");
    }

    /// Called once the retries are exhausted, the runner then decides to skip or terminate.
    async fn process_failure(&mut self, _context: &mut ComputationContext, failure: &Error) {
        error!(computation = %self.metadata().name(), ?failure, "Failure after retries");
    }

    /// Persists the state of the computation, called by every checkpoint after the produced
    /// records are appended and before the offsets are committed.
    async fn checkpoint_state(&mut self, _context: &ComputationContext) -> Result<()> {
        Ok(())
    }

    /// The runner is going to stop. Must not block.
    fn signal_stop(&mut self) {}

    /// Called once when the runner exits.
    async fn destroy(&mut self) {}
}
