//! Partitioned stream processing over an append-only log.
//!
//! A [Topology] of computations is run by a [LogStreamProcessor]: every computation gets a
//! [ComputationPool] of runners, each runner reads some partitions of the computation input
//! streams, hands the records to the computation and periodically checkpoints:
//! - append the records produced since the last checkpoint
//! - save the computation state
//! - commit the read offsets
//!
//! Watermarks travel with the records so that the processor can tell when everything up to a
//! point in time went through the whole topology.

pub use self::error::{Error, Result};

mod error;

pub mod codec;
pub mod computation;
pub mod config;
pub mod filter;
pub mod log;
pub mod manager;
pub mod metrics;
pub mod pool;
pub mod processor;
pub mod record;
pub mod runner;
pub mod setup_tracing;
pub mod topology;
pub mod watermark;

pub use crate::computation::{
    BatchComputation, BatchRunner, Computation, ComputationBase, ComputationContext,
    ComputationMetadata, ComputationSupplier,
};
pub use crate::config::{ComputationPolicy, Settings};
pub use crate::log::{LogManager, MemLogManager};
pub use crate::manager::StreamManager;
pub use crate::pool::ComputationPool;
pub use crate::processor::{LogStreamProcessor, StreamProcessor};
pub use crate::record::{Flags, Record};
pub use crate::topology::Topology;
pub use crate::watermark::Watermark;
