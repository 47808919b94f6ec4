//! Hooks applied to the records of a stream when they are appended and read.

use std::fmt::Debug;
use std::sync::Arc;

use crate::log::LogOffset;
use crate::record::Record;

/// A filter can rewrite or drop (by returning `None`) the records of a stream.
pub trait RecordFilter: Send + Sync + Debug {
    fn before_append(&self, record: Record) -> Option<Record> {
        Some(record)
    }

    fn after_append(&self, _record: &Record, _offset: &LogOffset) {}

    fn after_read(&self, record: Record, _offset: &LogOffset) -> Option<Record> {
        Some(record)
    }
}

/// Filters of a stream, applied in insertion order. A dropped record does not reach the next
/// filters.
#[derive(Debug, Clone, Default)]
pub struct FilterChain {
    filters: Vec<Arc<dyn RecordFilter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, filter: Arc<dyn RecordFilter>) {
        self.filters.push(filter);
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn before_append(&self, record: Record) -> Option<Record> {
        self.filters
            .iter()
            .try_fold(record, |record, filter| filter.before_append(record))
    }

    pub fn after_append(&self, record: &Record, offset: &LogOffset) {
        self.filters
            .iter()
            .for_each(|filter| filter.after_append(record, offset));
    }

    pub fn after_read(&self, record: Record, offset: &LogOffset) -> Option<Record> {
        self.filters
            .iter()
            .try_fold(record, |record, filter| filter.after_read(record, offset))
    }
}
