//! An in-process broker: partitioned append-only logs plus per-group committed
//! offsets. Used for tests and local runs without Kafka.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use crate::errors::SourceError;
use crate::offsets::PartitionOffset;
use crate::record::{Partition, Record};
use crate::source::{PolledBatch, Source, SourceEvent};

#[derive(Default)]
struct BrokerState {
    logs: BTreeMap<Partition, Vec<Record>>,
    committed: HashMap<(String, Partition), i64>,
    commit_history: Vec<(String, PartitionOffset)>,
    pending_events: HashMap<String, VecDeque<SourceEvent>>,
    failing_commits: u32,
    fatal_error: Option<String>,
}

/// Handle to the shared broker state. Clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn create_topic(&self, topic: &str, partitions: i32) {
        let mut state = self.state();
        for partition in 0..partitions {
            state.logs.entry(Partition::new(topic, partition)).or_default();
        }
    }

    /// Appends a record at the next offset of the partition and returns that offset.
    pub fn produce(&self, topic: &str, partition: i32, value: impl Into<Vec<u8>>) -> i64 {
        let mut state = self.state();
        let log = state.logs.entry(Partition::new(topic, partition)).or_default();
        let offset = log.last().map_or(0, Record::next_offset);
        log.push(Record::new(topic, partition, offset, value).with_timestamp(Utc::now()));
        offset
    }

    /// Appends a fully built record. Its offset must be past the current end of the
    /// partition's log; gaps are allowed, as after compaction.
    pub fn produce_record(&self, record: Record) -> Result<(), SourceError> {
        let mut state = self.state();
        let log = state.logs.entry(record.partition()).or_default();
        if let Some(last) = log.last() {
            if record.offset <= last.offset {
                return Err(SourceError::Transient {
                    reason: format!(
                        "offset {} is not past the end of {} (last offset {})",
                        record.offset,
                        record.partition(),
                        last.offset
                    ),
                });
            }
        }
        log.push(record);
        Ok(())
    }

    pub fn committed(&self, group: &str, topic: &str, partition: i32) -> Option<i64> {
        self.state()
            .committed
            .get(&(group.to_string(), Partition::new(topic, partition)))
            .copied()
    }

    /// Every successful commit made by `group`, in order.
    pub fn commit_history(&self, group: &str) -> Vec<PartitionOffset> {
        self.state()
            .commit_history
            .iter()
            .filter(|(g, _)| g == group)
            .map(|(_, offset)| offset.clone())
            .collect()
    }

    /// Set a group's committed offset directly, as a previous consumer would have.
    pub fn seed_committed(&self, group: &str, topic: &str, partition: i32, offset: i64) {
        self.state()
            .committed
            .insert((group.to_string(), Partition::new(topic, partition)), offset);
    }

    /// Reject the next `count` commit requests.
    pub fn fail_next_commits(&self, count: u32) {
        self.state().failing_commits = count;
    }

    /// Make every following poll fail with a fatal connection error.
    pub fn fail_with_broker_error(&self, reason: &str) {
        self.state().fatal_error = Some(reason.to_string());
    }

    /// Queue a rebalance for `group`: revoke then assign.
    pub fn rebalance(&self, group: &str, revoked: Vec<Partition>, assigned: Vec<Partition>) {
        let mut state = self.state();
        let events = state.pending_events.entry(group.to_string()).or_default();
        if !revoked.is_empty() {
            events.push_back(SourceEvent::Revoked(revoked));
        }
        if !assigned.is_empty() {
            events.push_back(SourceEvent::Assigned(assigned));
        }
    }

    /// A consumer for `topic` in `group`. It is assigned every partition of the
    /// topic that exists at its first poll.
    pub fn source(&self, topic: &str, group: &str) -> MemorySource {
        MemorySource {
            broker: self.clone(),
            topic: topic.to_string(),
            group: group.to_string(),
            positions: BTreeMap::new(),
            joined: false,
            closed: false,
        }
    }
}

pub struct MemorySource {
    broker: MemoryBroker,
    topic: String,
    group: String,
    positions: BTreeMap<Partition, i64>,
    joined: bool,
    closed: bool,
}

impl MemorySource {
    pub fn assignment(&self) -> Vec<Partition> {
        self.positions.keys().cloned().collect()
    }

    fn take_batch(&mut self, max_records: usize) -> Result<PolledBatch, SourceError> {
        let broker = self.broker.clone();
        let mut state = broker.state();

        if let Some(reason) = &state.fatal_error {
            return Err(SourceError::Connection {
                reason: reason.clone(),
            });
        }

        let mut events = Vec::new();
        if !self.joined {
            self.joined = true;
            let partitions: Vec<Partition> = state
                .logs
                .keys()
                .filter(|p| p.topic() == self.topic)
                .cloned()
                .collect();
            events.push(SourceEvent::Assigned(partitions));
        }
        if let Some(pending) = state.pending_events.get_mut(&self.group) {
            events.extend(pending.drain(..));
        }

        for event in &events {
            match event {
                SourceEvent::Assigned(partitions) => {
                    for partition in partitions {
                        let start = state
                            .committed
                            .get(&(self.group.clone(), partition.clone()))
                            .copied()
                            .unwrap_or(0);
                        self.positions.insert(partition.clone(), start);
                    }
                }
                SourceEvent::Revoked(partitions) => {
                    for partition in partitions {
                        self.positions.remove(partition);
                    }
                }
            }
        }

        let mut records = Vec::new();
        for (partition, position) in self.positions.iter_mut() {
            let Some(log) = state.logs.get(partition) else {
                continue;
            };
            let start = *position;
            for record in log.iter().filter(|r| r.offset >= start) {
                if records.len() >= max_records {
                    break;
                }
                *position = record.next_offset();
                records.push(record.clone());
            }
        }

        Ok(PolledBatch { records, events })
    }
}

#[async_trait]
impl Source for MemorySource {
    async fn poll(&mut self, max_records: usize, timeout: Duration) -> Result<PolledBatch, SourceError> {
        if self.closed {
            return Err(SourceError::Connection {
                reason: "source is shut down".to_string(),
            });
        }

        let batch = self.take_batch(max_records)?;
        if batch.is_empty() {
            tokio::time::sleep(timeout).await;
        } else {
            debug!(
                "Polled {} records and {} events from {}",
                batch.records.len(),
                batch.events.len(),
                self.topic
            );
        }
        Ok(batch)
    }

    async fn commit(&self, offsets: &[PartitionOffset]) -> Result<(), SourceError> {
        let mut state = self.broker.state();
        if state.failing_commits > 0 {
            state.failing_commits -= 1;
            return Err(SourceError::Commit {
                reason: "commit rejected by broker".to_string(),
            });
        }
        for offset in offsets {
            state
                .committed
                .insert((self.group.clone(), offset.partition().clone()), offset.offset());
            state.commit_history.push((self.group.clone(), offset.clone()));
        }
        Ok(())
    }

    async fn committed(&self, partitions: &[Partition]) -> Result<Vec<PartitionOffset>, SourceError> {
        let state = self.broker.state();
        Ok(partitions
            .iter()
            .filter_map(|partition| {
                state
                    .committed
                    .get(&(self.group.clone(), partition.clone()))
                    .map(|offset| PartitionOffset::new(partition.clone(), *offset))
            })
            .collect())
    }

    async fn shutdown(&mut self) -> Result<(), SourceError> {
        self.closed = true;
        self.positions.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(5);

    #[tokio::test]
    async fn test_first_poll_assigns_existing_partitions() {
        let broker = MemoryBroker::new();
        broker.create_topic("topic-1", 2);
        broker.produce("topic-1", 1, "a");

        let mut source = broker.source("topic-1", "group-1");
        let batch = source.poll(10, TIMEOUT).await.unwrap();

        assert_eq!(
            batch.events,
            vec![SourceEvent::Assigned(vec![
                Partition::new("topic-1", 0),
                Partition::new("topic-1", 1)
            ])]
        );
        assert_eq!(batch.records.len(), 1);
        assert_eq!(batch.records[0].partition, 1);
    }

    #[tokio::test]
    async fn test_poll_respects_max_records_and_order() {
        let broker = MemoryBroker::new();
        for i in 0..5 {
            broker.produce("topic-1", 0, format!("m{i}"));
        }

        let mut source = broker.source("topic-1", "group-1");
        let first = source.poll(3, TIMEOUT).await.unwrap();
        let second = source.poll(3, TIMEOUT).await.unwrap();

        let offsets: Vec<i64> = first
            .records
            .iter()
            .chain(second.records.iter())
            .map(|r| r.offset)
            .collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
        assert!(source.poll(3, TIMEOUT).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_new_member_resumes_from_committed_offset() {
        let broker = MemoryBroker::new();
        for i in 0..4 {
            broker.produce("topic-1", 0, format!("m{i}"));
        }
        broker.seed_committed("group-1", "topic-1", 0, 2);

        let mut source = broker.source("topic-1", "group-1");
        let batch = source.poll(10, TIMEOUT).await.unwrap();
        assert_eq!(batch.records.first().map(|r| r.offset), Some(2));

        let other_group = broker.source("topic-1", "group-2").poll(10, TIMEOUT).await.unwrap();
        assert_eq!(other_group.records.len(), 4);
    }

    #[tokio::test]
    async fn test_produce_record_rejects_offsets_behind_log_end() {
        let broker = MemoryBroker::new();
        broker
            .produce_record(Record::new("topic-1", 0, 5, "five"))
            .unwrap();
        assert!(broker
            .produce_record(Record::new("topic-1", 0, 5, "again"))
            .is_err());
        assert_eq!(broker.produce("topic-1", 0, "six"), 6);
    }

    #[tokio::test]
    async fn test_injected_commit_failures() {
        let broker = MemoryBroker::new();
        broker.create_topic("topic-1", 1);
        let source = broker.source("topic-1", "group-1");
        let offsets = vec![PartitionOffset::new(Partition::new("topic-1", 0), 3)];

        broker.fail_next_commits(1);
        assert!(matches!(
            source.commit(&offsets).await,
            Err(SourceError::Commit { .. })
        ));
        source.commit(&offsets).await.unwrap();
        assert_eq!(broker.committed("group-1", "topic-1", 0), Some(3));
        assert_eq!(broker.commit_history("group-1"), offsets);
    }

    #[tokio::test]
    async fn test_rebalance_events_are_delivered_in_order() {
        let broker = MemoryBroker::new();
        broker.create_topic("topic-1", 2);
        let mut source = broker.source("topic-1", "group-1");
        source.poll(10, TIMEOUT).await.unwrap();

        broker.rebalance(
            "group-1",
            vec![Partition::new("topic-1", 1)],
            Vec::new(),
        );
        let batch = source.poll(10, TIMEOUT).await.unwrap();
        assert_eq!(
            batch.events,
            vec![SourceEvent::Revoked(vec![Partition::new("topic-1", 1)])]
        );
        assert_eq!(source.assignment(), vec![Partition::new("topic-1", 0)]);
    }

    #[tokio::test]
    async fn test_fatal_broker_error() {
        let broker = MemoryBroker::new();
        broker.fail_with_broker_error("SASL authentication failed");
        let mut source = broker.source("topic-1", "group-1");

        let err = source.poll(10, TIMEOUT).await.unwrap_err();
        assert!(err.is_fatal());
    }
}
