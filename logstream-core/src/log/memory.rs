//! In-memory partitioned log.
//!
//! Records are kept for the lifetime of the manager, nothing is ever truncated. Tailers of the
//! same group share the committed offsets stored in the manager.
//!
//! In subscribe mode the partitions of the subscribed streams are spread round-robin over the
//! live subscribers of the group. Every subscribe or close bumps the group generation; a tailer
//! notices the new generation on its next read, calls its [RebalanceListener] (revoked, then
//! assigned) and restarts from the committed offsets of its new partitions.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

use crate::log::{
    LogLag, LogManager, LogOffset, LogPartition, LogRecord, LogTailer, RebalanceListener,
};

mod error;
mod error_injector;

pub use error::LogError;
pub use error_injector::ErrorInjector;

type GroupPartition = (String, LogPartition);

#[derive(Debug, Default)]
struct State {
    /// stream -> partitions -> records
    streams: HashMap<String, Vec<Vec<Bytes>>>,
    committed: HashMap<GroupPartition, u64>,
    /// partitions explicitly assigned to a tailer
    owners: HashMap<GroupPartition, u64>,
    subscriptions: HashMap<String, Subscription>,
    next_tailer_id: u64,
}

#[derive(Debug, Default)]
struct Subscription {
    generation: u64,
    members: Vec<Member>,
}

#[derive(Debug)]
struct Member {
    tailer_id: u64,
    streams: Vec<String>,
}

impl State {
    fn partition(&self, partition: &LogPartition) -> error::Result<&Vec<Bytes>> {
        self.streams
            .get(&partition.stream)
            .ok_or_else(|| LogError::UnknownStream(partition.stream.clone()))?
            .get(usize::from(partition.partition))
            .ok_or_else(|| LogError::UnknownPartition(partition.to_string()))
    }

    fn committed(&self, group: &str, partition: &LogPartition) -> u64 {
        self.committed
            .get(&(group.to_string(), partition.clone()))
            .copied()
            .unwrap_or_default()
    }

    fn next_tailer_id(&mut self) -> u64 {
        self.next_tailer_id += 1;
        self.next_tailer_id
    }

    /// Round-robin of every partition of a stream over the members subscribed to it.
    fn subscription_assignment(&self, group: &str, tailer_id: u64) -> Vec<LogPartition> {
        let Some(subscription) = self.subscriptions.get(group) else {
            return vec![];
        };
        let streams: BTreeSet<&String> = subscription
            .members
            .iter()
            .flat_map(|m| m.streams.iter())
            .collect();
        let mut assignment = vec![];
        for stream in streams {
            let subscribers: Vec<u64> = subscription
                .members
                .iter()
                .filter(|m| m.streams.contains(stream))
                .map(|m| m.tailer_id)
                .collect();
            let size = self.streams.get(stream).map_or(0, Vec::len);
            for partition in 0..size {
                if subscribers.get(partition % subscribers.len()) == Some(&tailer_id) {
                    assignment.push(LogPartition::of(stream.as_str(), partition as u16));
                }
            }
        }
        assignment
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<State>,
    appended: Notify,
    injector: ErrorInjector,
}

/// In-memory [LogManager]. Cloning gives another handle on the same log.
#[derive(Debug, Clone, Default)]
pub struct MemLogManager {
    shared: Arc<Shared>,
}

impl MemLogManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn error_injector(&self) -> &ErrorInjector {
        &self.shared.injector
    }

    /// Committed offset of a group on a partition, 0 when nothing was committed.
    pub fn committed(&self, group: &str, partition: &LogPartition) -> u64 {
        self.shared.state.lock().committed(group, partition)
    }

    fn tailer(&self, group: &str, tailer_id: u64) -> MemLogTailer {
        MemLogTailer {
            id: tailer_id,
            group: group.to_string(),
            shared: Arc::clone(&self.shared),
            assignments: vec![],
            positions: HashMap::new(),
            next: 0,
            subscription: None,
            closed: false,
        }
    }
}

#[async_trait]
impl LogManager for MemLogManager {
    async fn exists(&self, stream: &str) -> bool {
        self.shared.state.lock().streams.contains_key(stream)
    }

    async fn create_if_not_exists(&self, stream: &str, partitions: u16) -> crate::Result<bool> {
        if partitions == 0 {
            return Err(crate::Error::Config(format!(
                "stream {stream} needs at least one partition"
            )));
        }
        let mut state = self.shared.state.lock();
        if state.streams.contains_key(stream) {
            return Ok(false);
        }
        state
            .streams
            .insert(stream.to_string(), vec![vec![]; usize::from(partitions)]);
        debug!(stream, partitions, "Created stream");
        Ok(true)
    }

    async fn size(&self, stream: &str) -> crate::Result<u16> {
        let state = self.shared.state.lock();
        let partitions = state
            .streams
            .get(stream)
            .ok_or_else(|| LogError::UnknownStream(stream.to_string()))?;
        Ok(partitions.len() as u16)
    }

    async fn append(&self, stream: &str, partition: u16, data: Bytes) -> crate::Result<LogOffset> {
        if self.shared.injector.should_fail_append() {
            return Err(LogError::Append("injected failure".to_string()).into());
        }
        let log_partition = LogPartition::of(stream, partition);
        let offset = {
            let mut state = self.shared.state.lock();
            let records = state
                .streams
                .get_mut(stream)
                .ok_or_else(|| LogError::UnknownStream(stream.to_string()))?
                .get_mut(usize::from(partition))
                .ok_or_else(|| LogError::UnknownPartition(log_partition.to_string()))?;
            records.push(data);
            records.len() as u64 - 1
        };
        self.shared.appended.notify_waiters();
        Ok(LogOffset::new(log_partition, offset))
    }

    async fn create_tailer(
        &self,
        group: &str,
        partitions: Vec<LogPartition>,
    ) -> crate::Result<Box<dyn LogTailer>> {
        let mut state = self.shared.state.lock();
        for partition in &partitions {
            state.partition(partition)?;
            if state
                .owners
                .contains_key(&(group.to_string(), partition.clone()))
            {
                return Err(LogError::AlreadyAssigned {
                    group: group.to_string(),
                    partition: partition.to_string(),
                }
                .into());
            }
        }
        let tailer_id = state.next_tailer_id();
        let mut positions = HashMap::new();
        for partition in &partitions {
            state
                .owners
                .insert((group.to_string(), partition.clone()), tailer_id);
            positions.insert(partition.clone(), state.committed(group, partition));
        }
        drop(state);

        let mut tailer = self.tailer(group, tailer_id);
        tailer.assignments = partitions;
        tailer.positions = positions;
        Ok(Box::new(tailer))
    }

    fn supports_subscribe(&self) -> bool {
        true
    }

    async fn subscribe(
        &self,
        group: &str,
        streams: Vec<String>,
        listener: Arc<dyn RebalanceListener>,
    ) -> crate::Result<Box<dyn LogTailer>> {
        let mut state = self.shared.state.lock();
        if let Some(missing) = streams.iter().find(|s| !state.streams.contains_key(*s)) {
            return Err(LogError::UnknownStream(missing.clone()).into());
        }
        let tailer_id = state.next_tailer_id();
        let subscription = state.subscriptions.entry(group.to_string()).or_default();
        subscription.members.push(Member { tailer_id, streams });
        subscription.generation += 1;
        drop(state);

        let mut tailer = self.tailer(group, tailer_id);
        tailer.subscription = Some(TailerSubscription {
            listener,
            generation: 0,
        });
        Ok(Box::new(tailer))
    }

    async fn lag_per_partition(&self, stream: &str, group: &str) -> crate::Result<Vec<LogLag>> {
        let state = self.shared.state.lock();
        let partitions = state
            .streams
            .get(stream)
            .ok_or_else(|| LogError::UnknownStream(stream.to_string()))?;
        Ok(partitions
            .iter()
            .enumerate()
            .map(|(i, records)| {
                let committed = state.committed(group, &LogPartition::of(stream, i as u16));
                LogLag::new(committed, records.len() as u64)
            })
            .collect())
    }

    async fn read_at(&self, offset: &LogOffset) -> crate::Result<Option<LogRecord>> {
        let state = self.shared.state.lock();
        let records = state.partition(&offset.partition)?;
        Ok(usize::try_from(offset.offset)
            .ok()
            .and_then(|o| records.get(o))
            .map(|data| LogRecord {
                offset: offset.clone(),
                data: data.clone(),
            }))
    }
}

struct TailerSubscription {
    listener: Arc<dyn RebalanceListener>,
    /// group generation the current assignment was computed for
    generation: u64,
}

pub struct MemLogTailer {
    id: u64,
    group: String,
    shared: Arc<Shared>,
    assignments: Vec<LogPartition>,
    /// next offset to read per partition
    positions: HashMap<LogPartition, u64>,
    /// index of the partition to look at first, so partitions are read fairly
    next: usize,
    subscription: Option<TailerSubscription>,
    closed: bool,
}

impl fmt::Debug for MemLogTailer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemLogTailer")
            .field("id", &self.id)
            .field("group", &self.group)
            .field("assignments", &self.assignments)
            .field("positions", &self.positions)
            .field("subscribed", &self.subscription.is_some())
            .field("closed", &self.closed)
            .finish()
    }
}

impl MemLogTailer {
    fn check_rebalance(&mut self) {
        let Some(subscription) = &mut self.subscription else {
            return;
        };
        let (assignment, positions) = {
            let state = self.shared.state.lock();
            let generation = state
                .subscriptions
                .get(&self.group)
                .map_or(0, |s| s.generation);
            if generation == subscription.generation {
                return;
            }
            subscription.generation = generation;
            let assignment = state.subscription_assignment(&self.group, self.id);
            let positions: HashMap<LogPartition, u64> = assignment
                .iter()
                .map(|p| (p.clone(), state.committed(&self.group, p)))
                .collect();
            (assignment, positions)
        };
        let revoked = std::mem::replace(&mut self.assignments, assignment);
        self.positions = positions;
        self.next = 0;
        debug!(group = %self.group, ?revoked, assigned = ?self.assignments, "Rebalance");
        if !revoked.is_empty() {
            subscription.listener.on_partitions_revoked(&revoked);
        }
        subscription
            .listener
            .on_partitions_assigned(&self.assignments);
    }

    fn poll_record(&mut self) -> Option<LogRecord> {
        let state = self.shared.state.lock();
        let count = self.assignments.len();
        for i in 0..count {
            let idx = (self.next + i) % count;
            let Some(partition) = self.assignments.get(idx) else {
                continue;
            };
            let Some(position) = self.positions.get_mut(partition) else {
                continue;
            };
            let data = state
                .partition(partition)
                .ok()
                .and_then(|records| records.get(*position as usize));
            if let Some(data) = data {
                let offset = LogOffset::new(partition.clone(), *position);
                *position += 1;
                self.next = idx + 1;
                return Some(LogRecord {
                    offset,
                    data: data.clone(),
                });
            }
        }
        None
    }

    fn release(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let mut state = self.shared.state.lock();
        let id = self.id;
        state.owners.retain(|_, owner| *owner != id);
        if self.subscription.is_some()
            && let Some(subscription) = state.subscriptions.get_mut(&self.group)
        {
            subscription.members.retain(|m| m.tailer_id != id);
            subscription.generation += 1;
        }
    }
}

#[async_trait]
impl LogTailer for MemLogTailer {
    async fn read(&mut self, timeout: Duration) -> crate::Result<Option<LogRecord>> {
        if self.closed {
            return Err(LogError::Closed.into());
        }
        if self.shared.injector.should_fail_read() {
            return Err(LogError::Read("injected failure".to_string()).into());
        }
        self.check_rebalance();
        let deadline = Instant::now() + timeout;
        let shared = Arc::clone(&self.shared);
        loop {
            let notified = shared.appended.notified();
            tokio::pin!(notified);
            // register before looking so that an append in between is not missed
            notified.as_mut().enable();
            if let Some(record) = self.poll_record() {
                return Ok(Some(record));
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Ok(None);
            }
        }
    }

    async fn commit(&mut self) -> crate::Result<()> {
        if self.closed {
            return Err(LogError::Closed.into());
        }
        if self.shared.injector.should_fail_commit() {
            return Err(LogError::Commit("injected failure".to_string()).into());
        }
        let mut state = self.shared.state.lock();
        for (partition, position) in &self.positions {
            state
                .committed
                .insert((self.group.clone(), partition.clone()), *position);
        }
        Ok(())
    }

    fn assignments(&self) -> Vec<LogPartition> {
        self.assignments.clone()
    }

    fn group(&self) -> &str {
        &self.group
    }

    async fn to_last_committed(&mut self) -> crate::Result<()> {
        let state = self.shared.state.lock();
        for (partition, position) in self.positions.iter_mut() {
            *position = state.committed(&self.group, partition);
        }
        Ok(())
    }

    async fn close(&mut self) -> crate::Result<()> {
        self.release();
        Ok(())
    }
}

impl Drop for MemLogTailer {
    fn drop(&mut self) {
        self.release();
    }
}
