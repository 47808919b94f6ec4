//! Named processors sharing one [LogManager].
//!
//! The manager remembers the [Settings] each stream was registered with, so that records
//! appended from outside a computation use the same codec, partitioning and filters as the
//! computations writing to the stream.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};

use crate::Error;
use crate::Result;
use crate::config::Settings;
use crate::log::{LogManager, LogOffset, partition_of};
use crate::processor::{LogStreamProcessor, StreamProcessor};
use crate::record::Record;
use crate::topology::Topology;

pub struct StreamManager {
    log_manager: Arc<dyn LogManager>,
    subscribe: bool,
    processors: HashMap<String, (Topology, Settings)>,
    streams: HashMap<String, Settings>,
}

impl StreamManager {
    pub fn new(log_manager: Arc<dyn LogManager>) -> Self {
        Self {
            log_manager,
            subscribe: false,
            processors: HashMap::new(),
            streams: HashMap::new(),
        }
    }

    /// Processors created by this manager use the dynamic partition assignment.
    pub fn with_subscribe(mut self, subscribe: bool) -> Self {
        self.subscribe = subscribe;
        self
    }

    pub fn log_manager(&self) -> Arc<dyn LogManager> {
        Arc::clone(&self.log_manager)
    }

    /// Creates the streams of the topology and keeps it under `name`. Registering a name again
    /// replaces the previous registration.
    pub async fn register(
        &mut self,
        name: impl Into<String>,
        topology: Topology,
        settings: Settings,
    ) -> Result<()> {
        let name = name.into();
        for stream in topology.streams() {
            let partitions = settings.partitions(stream);
            if self
                .log_manager
                .create_if_not_exists(stream, partitions)
                .await?
            {
                debug!(stream, partitions, "Stream created");
            }
            self.streams.insert(stream.to_string(), settings.clone());
        }
        info!(processor = %name, computations = ?topology.computations(), "Processor registered");
        self.processors.insert(name, (topology, settings));
        Ok(())
    }

    /// Returns an initialized processor, ready to be started.
    pub async fn create_stream_processor(&self, name: &str) -> Result<LogStreamProcessor> {
        let (topology, settings) = self
            .processors
            .get(name)
            .ok_or_else(|| Error::Processor(format!("unknown processor {name}")))?;
        let mut processor = LogStreamProcessor::new(Arc::clone(&self.log_manager))
            .with_subscribe(self.subscribe);
        processor.init(topology.clone(), settings.clone()).await?;
        Ok(processor)
    }

    pub async fn register_and_create_processor(
        &mut self,
        name: impl Into<String>,
        topology: Topology,
        settings: Settings,
    ) -> Result<LogStreamProcessor> {
        let name = name.into();
        self.register(name.as_str(), topology, settings).await?;
        self.create_stream_processor(&name).await
    }

    /// Appends a record to a registered stream. Returns `None` when a filter drops the record.
    pub async fn append(&self, stream: &str, record: Record) -> Result<Option<LogOffset>> {
        let settings = self
            .streams
            .get(stream)
            .ok_or_else(|| Error::Config(format!("stream {stream} is not registered")))?;
        let filters = settings.filters(stream);
        let Some(record) = filters.before_append(record) else {
            return Ok(None);
        };
        let partitions = self.log_manager.size(stream).await?;
        let partition = partition_of(record.key(), partitions);
        let data = settings.codec(stream).encode(&record)?;
        let offset = self.log_manager.append(stream, partition, data).await?;
        filters.after_append(&record, &offset);
        Ok(Some(offset))
    }
}
