use std::collections::HashSet;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{CommitPolicy, DeliveryMode, ListenerConfig};
use crate::delivery::{DeliveryController, Disposition, RetryPolicy};
use crate::errors::ConsumeError;
use crate::offsets::{ConsumerGroupState, OffsetTracker, PartitionOffset};
use crate::record::{Partition, Record};
use crate::sink::FailureKind;
use crate::source::{Source, SourceEvent};
use crate::telemetry::ConsumeMetrics;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Polling,
    Processing,
    Committing,
    Failed,
}

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub listener: String,
    pub worker_id: usize,
    pub max_poll_records: usize,
    pub poll_timeout: Duration,
    pub delivery: DeliveryMode,
    pub commit_policy: CommitPolicy,
}

impl WorkerSettings {
    pub fn from_listener(listener: &ListenerConfig, worker_id: usize) -> Self {
        Self {
            listener: listener.name.clone(),
            worker_id,
            max_poll_records: listener.processing.max_poll_records.max(1),
            poll_timeout: listener.processing.poll_timeout(),
            delivery: listener.processing.delivery,
            commit_policy: listener.processing.commit_policy,
        }
    }
}

/// Final state of a worker after `run` returns.
#[derive(Debug)]
pub struct WorkerReport {
    pub listener: String,
    pub worker_id: usize,
    pub state: LoopState,
    pub metrics: ConsumeMetrics,
    /// Committed offsets of the partitions owned at exit.
    pub committed: ConsumerGroupState,
    /// Set when the worker stopped in `Failed`.
    pub error: Option<ConsumeError>,
}

enum Cycle {
    Continue,
    Stop,
}

/// One consumer-group member: polls its source, hands each record to the
/// delivery controller and commits what has been disposed of.
///
/// Offsets only advance past records that were handled or dead-lettered, and
/// records of one partition are processed strictly in offset order.
pub struct Worker<S> {
    settings: WorkerSettings,
    source: S,
    delivery: DeliveryController,
    commit_retry: RetryPolicy,
    tracker: OffsetTracker,
    state: LoopState,
    metrics: ConsumeMetrics,
}

impl<S: Source> Worker<S> {
    pub fn new(settings: WorkerSettings, source: S, delivery: DeliveryController) -> Self {
        let commit_retry = delivery.retry_policy().clone();
        Self {
            settings,
            source,
            delivery,
            commit_retry,
            tracker: OffsetTracker::new(),
            state: LoopState::Idle,
            metrics: ConsumeMetrics::default(),
        }
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn metrics(&self) -> &ConsumeMetrics {
        &self.metrics
    }

    /// Runs until `shutdown` flips to true (or its sender is dropped) or a fatal
    /// error occurs. Processed offsets are committed before returning either way.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> WorkerReport {
        info!(
            listener = %self.settings.listener,
            worker = self.settings.worker_id,
            "Starting consumption loop"
        );

        let error = loop {
            if *shutdown.borrow() {
                break None;
            }
            match self.run_once(&mut shutdown).await {
                Ok(Cycle::Continue) => {}
                Ok(Cycle::Stop) => break None,
                Err(e) => break Some(e),
            }
        };

        match error {
            None => {
                if let Err(e) = self.shutdown().await {
                    error!(listener = %self.settings.listener, error = %e, "Shutdown failed");
                    return self.into_report(Some(e));
                }
                info!(
                    listener = %self.settings.listener,
                    worker = self.settings.worker_id,
                    records = self.metrics.total_records,
                    "Consumption loop stopped"
                );
                self.into_report(None)
            }
            Some(e) => {
                error!(
                    listener = %self.settings.listener,
                    worker = self.settings.worker_id,
                    error = %e,
                    "Consumption loop failed"
                );
                if let Err(commit_err) = self.commit_pending().await {
                    warn!(error = %commit_err, "Could not commit processed offsets after failure");
                }
                if let Err(close_err) = self.source.shutdown().await {
                    warn!(error = %close_err, "Could not close source after failure");
                }
                self.state = LoopState::Failed;
                self.into_report(Some(e))
            }
        }
    }

    /// A single poll-process-commit cycle.
    async fn run_once(&mut self, shutdown: &mut watch::Receiver<bool>) -> Result<Cycle, ConsumeError> {
        self.state = LoopState::Polling;

        let polled = tokio::select! {
            biased;
            _ = shutdown.changed() => return Ok(Cycle::Stop),
            polled = self.source.poll(self.settings.max_poll_records, self.settings.poll_timeout) => polled,
        };

        let batch = match polled {
            Ok(batch) => batch,
            Err(e) if e.is_fatal() => return Err(e.into()),
            Err(e) => {
                let e = ConsumeError::from(e);
                let delay = Duration::from_millis(e.get_retry_delay_ms());
                warn!(error = %e, "Poll failed, retrying in {:?}", delay);
                tokio::time::sleep(delay).await;
                return Ok(Cycle::Continue);
            }
        };

        if *shutdown.borrow() {
            debug!("Shutdown requested, discarding polled batch");
            return Ok(Cycle::Stop);
        }

        let discarded = self.apply_events(batch.events).await?;
        let records: Vec<Record> = batch
            .records
            .into_iter()
            .filter(|record| !discarded.contains(&record.partition()))
            .collect();

        if records.is_empty() {
            // Offsets left pending by an earlier rejected commit.
            self.commit_pending().await?;
            return Ok(Cycle::Continue);
        }

        self.metrics.batches_processed += 1;
        let cycle = match self.settings.delivery {
            DeliveryMode::AtLeastOnce => self.process_at_least_once(records, shutdown).await?,
            DeliveryMode::AtMostOnce => self.process_at_most_once(records, shutdown).await?,
        };

        if self.settings.commit_policy == CommitPolicy::PerBatch {
            self.commit_pending().await?;
        }
        Ok(cycle)
    }

    async fn process_at_least_once(
        &mut self,
        records: Vec<Record>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Cycle, ConsumeError> {
        for record in records {
            if *shutdown.borrow() {
                return Ok(Cycle::Stop);
            }
            let partition = record.partition();
            self.accept(&partition, &record);

            self.state = LoopState::Processing;
            self.deliver(&record).await?;
            self.tracker.mark_processed(&partition, record.offset);

            if self.settings.commit_policy == CommitPolicy::PerRecord {
                self.commit_pending().await?;
            }
        }
        Ok(Cycle::Continue)
    }

    /// Commits first, then handles. A record whose pre-commit failed is skipped.
    async fn process_at_most_once(
        &mut self,
        records: Vec<Record>,
        shutdown: &watch::Receiver<bool>,
    ) -> Result<Cycle, ConsumeError> {
        match self.settings.commit_policy {
            CommitPolicy::PerRecord => {
                for record in records {
                    if *shutdown.borrow() {
                        return Ok(Cycle::Stop);
                    }
                    let partition = record.partition();
                    self.accept(&partition, &record);
                    self.tracker.mark_processed(&partition, record.offset);

                    if !self.commit_pending().await? {
                        self.skip(std::slice::from_ref(&record));
                        continue;
                    }
                    self.state = LoopState::Processing;
                    self.deliver(&record).await?;
                }
            }
            CommitPolicy::PerBatch => {
                for record in &records {
                    let partition = record.partition();
                    self.accept(&partition, record);
                    self.tracker.mark_processed(&partition, record.offset);
                }
                if !self.commit_pending().await? {
                    self.skip(&records);
                    return Ok(Cycle::Continue);
                }
                // Offsets are already committed; the batch is handled in full even
                // when shutdown is requested meanwhile.
                for record in &records {
                    self.state = LoopState::Processing;
                    self.deliver(record).await?;
                }
            }
        }
        Ok(Cycle::Continue)
    }

    fn accept(&mut self, partition: &Partition, record: &Record) {
        self.tracker.record_delivered(partition, record.offset);
        self.metrics.total_records += 1;
        self.metrics.bytes_processed += record.value.len() as u64;
    }

    fn skip(&mut self, records: &[Record]) {
        for record in records {
            error!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                "Offset commit failed before handling, skipping record"
            );
        }
        self.metrics.skipped_records += records.len();
    }

    async fn deliver(&mut self, record: &Record) -> Result<(), ConsumeError> {
        let disposition = self.delivery.deliver(record).await?;

        self.metrics.retries += disposition.retries() as usize;
        self.metrics.handler_failures += disposition.handler_failures() as usize;
        match disposition {
            Disposition::Handled { .. } => self.metrics.handled_records += 1,
            Disposition::DeadLettered { kind, .. } => {
                self.metrics.dead_lettered += 1;
                if kind == FailureKind::Decode {
                    self.metrics.decode_failures += 1;
                }
            }
        }
        Ok(())
    }

    /// Applies rebalance events in order. Returns the partitions this worker no
    /// longer owns; polled records from them must not be processed.
    async fn apply_events(&mut self, events: Vec<SourceEvent>) -> Result<HashSet<Partition>, ConsumeError> {
        let mut revoked_now = HashSet::new();

        for event in events {
            match event {
                SourceEvent::Revoked(partitions) => {
                    let flush: Vec<PartitionOffset> = partitions
                        .iter()
                        .filter_map(|partition| self.tracker.revoke(partition))
                        .collect();
                    info!(
                        listener = %self.settings.listener,
                        partitions = partitions.len(),
                        pending = flush.len(),
                        "Partitions revoked"
                    );
                    if !flush.is_empty() {
                        self.commit_offsets(&flush).await?;
                    }
                    revoked_now.extend(partitions);
                }
                SourceEvent::Assigned(partitions) => {
                    let committed = match self.source.committed(&partitions).await {
                        Ok(committed) => committed,
                        Err(e) if e.is_fatal() => return Err(e.into()),
                        Err(e) => {
                            warn!(error = %e, "Could not fetch committed offsets for assigned partitions");
                            Vec::new()
                        }
                    };
                    info!(
                        listener = %self.settings.listener,
                        partitions = partitions.len(),
                        "Partitions assigned"
                    );
                    for partition in partitions {
                        let offset = committed
                            .iter()
                            .find(|c| c.partition() == &partition)
                            .map(PartitionOffset::offset);
                        revoked_now.remove(&partition);
                        self.tracker.assign(partition, offset);
                    }
                }
            }
        }
        Ok(revoked_now)
    }

    /// Commits everything processed since the last commit. Returns false when
    /// the broker kept rejecting the commit; the offsets then stay pending.
    async fn commit_pending(&mut self) -> Result<bool, ConsumeError> {
        let pending = self.tracker.pending();
        if pending.is_empty() {
            return Ok(true);
        }
        let committed = self.commit_offsets(&pending).await?;
        if committed {
            self.tracker.mark_committed(&pending);
        }
        Ok(committed)
    }

    async fn commit_offsets(&mut self, offsets: &[PartitionOffset]) -> Result<bool, ConsumeError> {
        self.state = LoopState::Committing;
        let mut attempt = 0;

        loop {
            match self.source.commit(offsets).await {
                Ok(()) => {
                    self.metrics.commits += 1;
                    for offset in offsets {
                        debug!(
                            topic = offset.topic(),
                            partition = offset.partition_number(),
                            offset = offset.offset(),
                            "Committed offset"
                        );
                    }
                    return Ok(true);
                }
                Err(e) if e.is_fatal() => return Err(e.into()),
                Err(e) => {
                    self.metrics.commit_failures += 1;
                    if attempt >= self.commit_retry.max_retries {
                        warn!(error = %e, "Offset commit failed, leaving offsets pending");
                        return Ok(false);
                    }
                    attempt += 1;
                    let delay = self.commit_retry.retry_interval(attempt);
                    warn!(error = %e, attempt, "Offset commit failed, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Commits processed offsets and closes the source. Must be called during
    /// a graceful shutdown.
    async fn shutdown(&mut self) -> Result<(), ConsumeError> {
        if !self.commit_pending().await? {
            warn!(
                listener = %self.settings.listener,
                "Processed offsets could not be committed before shutdown"
            );
        }
        self.source.shutdown().await?;
        self.state = LoopState::Idle;
        Ok(())
    }

    fn into_report(mut self, error: Option<ConsumeError>) -> WorkerReport {
        let committed = self.tracker.group_state();
        self.tracker.clear();
        WorkerReport {
            listener: self.settings.listener,
            worker_id: self.settings.worker_id,
            state: self.state,
            metrics: self.metrics,
            committed,
            error,
        }
    }
}
