//! Offset tracking per partition.
//!
//! Offsets follow Kafka's commit convention: the stored value is the next
//! offset to consume (last processed offset + 1). A tracker belongs to a single
//! worker and is only mutated by it, so no locking is involved.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::record::Partition;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PartitionOffset {
    partition: Partition,
    offset: i64,
}

impl PartitionOffset {
    pub fn new(partition: Partition, offset: i64) -> Self {
        Self { partition, offset }
    }

    pub fn partition(&self) -> &Partition {
        &self.partition
    }

    pub fn topic(&self) -> &str {
        self.partition.topic()
    }

    pub fn partition_number(&self) -> i32 {
        self.partition.partition_number()
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }
}

/// Committed offset per owned partition.
pub type ConsumerGroupState = HashMap<Partition, PartitionOffset>;

#[derive(Debug, Default)]
struct PartitionState {
    committed: Option<i64>,
    processed: Option<i64>,
    highest_delivered: Option<i64>,
}

impl PartitionState {
    fn uncommitted(&self) -> Option<i64> {
        match (self.processed, self.committed) {
            (Some(processed), Some(committed)) if processed <= committed => None,
            (processed, _) => processed,
        }
    }
}

#[derive(Debug, Default)]
pub struct OffsetTracker {
    partitions: HashMap<Partition, PartitionState>,
}

impl OffsetTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a newly assigned partition from the broker's committed offset.
    pub fn assign(&mut self, partition: Partition, committed: Option<i64>) {
        debug!(
            topic = partition.topic(),
            partition = partition.partition_number(),
            committed = ?committed,
            "Tracking assigned partition"
        );
        self.partitions.insert(
            partition,
            PartitionState {
                committed,
                ..PartitionState::default()
            },
        );
    }

    /// Stop tracking a partition, returning its processed-but-uncommitted offset if any.
    pub fn revoke(&mut self, partition: &Partition) -> Option<PartitionOffset> {
        self.partitions
            .remove(partition)
            .and_then(|state| state.uncommitted())
            .map(|offset| PartitionOffset::new(partition.clone(), offset))
    }

    pub fn owns(&self, partition: &Partition) -> bool {
        self.partitions.contains_key(partition)
    }

    /// Note that `offset` was handed to the handler path.
    pub fn record_delivered(&mut self, partition: &Partition, offset: i64) {
        let state = self.partitions.entry(partition.clone()).or_default();
        if state.highest_delivered.is_none_or(|highest| offset > highest) {
            state.highest_delivered = Some(offset);
        }
    }

    /// Advance the processed offset past `offset`. Returns false when the
    /// advance would regress or would run ahead of what has been delivered.
    pub fn mark_processed(&mut self, partition: &Partition, offset: i64) -> bool {
        let Some(state) = self.partitions.get_mut(partition) else {
            warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset,
                "Processed offset for an untracked partition"
            );
            return false;
        };

        if state.highest_delivered.is_none_or(|highest| offset > highest) {
            warn!(
                topic = partition.topic(),
                partition = partition.partition_number(),
                offset,
                highest_delivered = ?state.highest_delivered,
                "Refusing to advance past an undelivered offset"
            );
            return false;
        }

        let next = offset + 1;
        if state.processed.is_some_and(|processed| next <= processed) {
            return false;
        }
        state.processed = Some(next);
        true
    }

    /// Offsets processed since the last successful commit.
    pub fn pending(&self) -> Vec<PartitionOffset> {
        let mut pending: Vec<PartitionOffset> = self
            .partitions
            .iter()
            .filter_map(|(partition, state)| {
                state
                    .uncommitted()
                    .map(|offset| PartitionOffset::new(partition.clone(), offset))
            })
            .collect();
        pending.sort_by(|a, b| a.partition().cmp(b.partition()));
        pending
    }

    /// Record a successful commit. Committed offsets never move backwards.
    pub fn mark_committed(&mut self, offsets: &[PartitionOffset]) {
        for committed in offsets {
            let Some(state) = self.partitions.get_mut(committed.partition()) else {
                continue;
            };
            if state.committed.is_some_and(|current| committed.offset() <= current) {
                continue;
            }
            if state
                .processed
                .is_none_or(|processed| committed.offset() > processed)
            {
                warn!(
                    topic = committed.topic(),
                    partition = committed.partition_number(),
                    offset = committed.offset(),
                    "Ignoring commit ahead of processed offset"
                );
                continue;
            }
            state.committed = Some(committed.offset());
        }
    }

    pub fn committed(&self, partition: &Partition) -> Option<i64> {
        self.partitions.get(partition).and_then(|state| state.committed)
    }

    pub fn processed(&self, partition: &Partition) -> Option<i64> {
        self.partitions.get(partition).and_then(|state| state.processed)
    }

    pub fn group_state(&self) -> ConsumerGroupState {
        self.partitions
            .iter()
            .filter_map(|(partition, state)| {
                state.committed.map(|offset| {
                    (
                        partition.clone(),
                        PartitionOffset::new(partition.clone(), offset),
                    )
                })
            })
            .collect()
    }

    /// Drop all state, used on shutdown.
    pub fn clear(&mut self) {
        self.partitions.clear();
    }
}
