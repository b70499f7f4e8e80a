pub mod kafka;
pub mod memory;

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::SourceError;
use crate::offsets::PartitionOffset;
use crate::record::{Partition, Record};

/// Partition ownership changes reported by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceEvent {
    Assigned(Vec<Partition>),
    Revoked(Vec<Partition>),
}

/// Result of one poll. Events happened while polling and must be applied
/// before `records`; records are in offset order within each partition.
#[derive(Debug, Default)]
pub struct PolledBatch {
    pub records: Vec<Record>,
    pub events: Vec<SourceEvent>,
}

impl PolledBatch {
    pub fn is_empty(&self) -> bool {
        self.records.is_empty() && self.events.is_empty()
    }
}

#[async_trait]
pub trait Source: Send + Sync {
    /// Receives up to `max_records` records.
    ///
    /// This method should block until records are available or `timeout` elapses.
    /// An empty batch indicates that the poll timed out without new records.
    async fn poll(&mut self, max_records: usize, timeout: Duration) -> Result<PolledBatch, SourceError>;

    /// Commits next-to-consume offsets for the given partitions.
    async fn commit(&self, offsets: &[PartitionOffset]) -> Result<(), SourceError>;

    /// The group's last committed offsets for `partitions`, as stored by the broker.
    async fn committed(&self, partitions: &[Partition]) -> Result<Vec<PartitionOffset>, SourceError>;

    /// Closes the connection to the source and cleans up resources.
    /// This should be called during graceful shutdown.
    async fn shutdown(&mut self) -> Result<(), SourceError>;
}
