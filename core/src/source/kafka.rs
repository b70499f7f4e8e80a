use anyhow::Result;
use async_trait::async_trait;
use chrono::DateTime;
use rdkafka::consumer::{
    BaseConsumer, CommitMode, Consumer, ConsumerContext, Rebalance, StreamConsumer,
};
use rdkafka::error::{KafkaError as RdKafkaError, RDKafkaErrorCode};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{ClientConfig, ClientContext, Offset, TopicPartitionList};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use crate::config::KafkaOptions;
use crate::errors::{KafkaError, SourceError};
use crate::offsets::PartitionOffset;
use crate::record::{Partition, Record};
use crate::source::{PolledBatch, Source, SourceEvent};

/// Forwards rebalance callbacks from librdkafka to the owning worker.
pub struct ListenerContext {
    events: mpsc::UnboundedSender<SourceEvent>,
}

impl ListenerContext {
    fn forward(&self, event: SourceEvent) {
        if let Err(e) = self.events.send(event) {
            error!("Failed to forward rebalance event: {}", e);
        }
    }
}

fn partitions_of(tpl: &TopicPartitionList) -> Vec<Partition> {
    tpl.elements()
        .iter()
        .map(|elem| Partition::new(elem.topic(), elem.partition()))
        .collect()
}

impl ClientContext for ListenerContext {}

impl ConsumerContext for ListenerContext {
    fn pre_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        match rebalance {
            Rebalance::Revoke(partitions) => {
                if partitions.count() == 0 {
                    return;
                }
                info!("Revoking {} partitions", partitions.count());
                self.forward(SourceEvent::Revoked(partitions_of(partitions)));
            }
            Rebalance::Assign(_) => {}
            Rebalance::Error(e) => error!("Rebalance error: {}", e),
        }
    }

    fn post_rebalance(&self, _base_consumer: &BaseConsumer<Self>, rebalance: &Rebalance) {
        if let Rebalance::Assign(partitions) = rebalance {
            if partitions.count() == 0 {
                return;
            }
            info!("Assigned {} partitions", partitions.count());
            self.forward(SourceEvent::Assigned(partitions_of(partitions)));
        }
    }
}

pub type ListenerConsumer = StreamConsumer<ListenerContext>;

pub struct KafkaConsumerClient {
    consumer: ListenerConsumer,
    topic: String,
}

impl KafkaConsumerClient {
    /// Builds a group member for `topic`. Auto-commit is always off; offsets are
    /// committed explicitly once records have been handled.
    pub fn new(
        config: &KafkaOptions,
        topic: &str,
        consumer_group: &str,
        client_suffix: &str,
    ) -> std::result::Result<(Self, mpsc::UnboundedReceiver<SourceEvent>), KafkaError> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("group.id", consumer_group)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set(
                "auto.offset.reset",
                config.auto_offset_reset.as_deref().unwrap_or("earliest"),
            );

        if let Some(client_id) = &config.client_id {
            client_config.set("client.id", format!("{client_id}-{consumer_group}-{client_suffix}"));
        }

        if let Some(timeout) = config.session_timeout_ms {
            client_config.set("session.timeout.ms", timeout.to_string());
        }

        if let Some(heartbeat) = config.heartbeat_interval_ms {
            client_config.set("heartbeat.interval.ms", heartbeat.to_string());
        }

        if let Some(security_protocol) = &config.security_protocol {
            client_config.set("security.protocol", security_protocol);
        }

        if let Some(sasl_mechanisms) = &config.sasl_mechanisms {
            client_config.set("sasl.mechanisms", sasl_mechanisms);
        }

        if let Some(sasl_username) = &config.sasl_username {
            client_config.set("sasl.username", sasl_username);
        }

        if let Some(sasl_password) = &config.sasl_password {
            client_config.set("sasl.password", sasl_password);
        }

        if let Some(ssl_ca_location) = &config.ssl_ca_location {
            client_config.set("ssl.ca.location", ssl_ca_location);
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let consumer: ListenerConsumer = client_config
            .create_with_context(ListenerContext { events: tx })
            .map_err(|e| KafkaError::ConsumerCreation {
                reason: e.to_string(),
            })?;

        Ok((
            Self {
                consumer,
                topic: topic.to_string(),
            },
            rx,
        ))
    }

    pub fn subscribe(&self) -> std::result::Result<(), KafkaError> {
        self.consumer
            .subscribe(&[self.topic.as_str()])
            .map_err(|e| KafkaError::Subscription {
                topic: self.topic.clone(),
                reason: e.to_string(),
            })?;

        info!("Subscribed to Kafka topic: {}", self.topic);
        Ok(())
    }

    pub async fn consume_batch(
        &self,
        max_records: usize,
        batch_timeout: Duration,
    ) -> std::result::Result<Vec<Record>, SourceError> {
        let mut records = Vec::new();
        let deadline = Instant::now() + batch_timeout;

        while records.len() < max_records {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }

            match timeout(remaining, self.consumer.recv()).await {
                Ok(Ok(message)) => {
                    debug!(
                        "Received message from partition {} offset {}",
                        message.partition(),
                        message.offset()
                    );
                    records.push(convert_message(&message));
                }
                Ok(Err(e)) => {
                    if let Some(fatal) = classify_consume_error(e) {
                        return Err(fatal);
                    }
                }
                Err(_) => break,
            }
        }

        if !records.is_empty() {
            debug!("Consumed batch of {} messages", records.len());
        }

        Ok(records)
    }

    pub fn commit_offsets(&self, offsets: &[PartitionOffset]) -> std::result::Result<(), SourceError> {
        if offsets.is_empty() {
            return Ok(());
        }

        let mut tpl = TopicPartitionList::new();
        for offset in offsets {
            tpl.add_partition_offset(
                offset.topic(),
                offset.partition_number(),
                Offset::Offset(offset.offset()),
            )
            .map_err(|e| SourceError::Commit {
                reason: e.to_string(),
            })?;
        }

        self.consumer
            .commit(&tpl, CommitMode::Sync)
            .map_err(classify_commit_error)?;

        debug!("Committed offsets for {} partitions", offsets.len());
        Ok(())
    }

    pub fn committed_offsets(
        &self,
        partitions: &[Partition],
    ) -> std::result::Result<Vec<PartitionOffset>, SourceError> {
        let mut tpl = TopicPartitionList::new();
        for partition in partitions {
            tpl.add_partition(partition.topic(), partition.partition_number());
        }

        let committed = self
            .consumer
            .committed_offsets(tpl, Duration::from_secs(10))
            .map_err(|e| SourceError::Transient {
                reason: e.to_string(),
            })?;

        Ok(committed
            .elements()
            .iter()
            .filter_map(|elem| match elem.offset() {
                Offset::Offset(offset) => Some(PartitionOffset::new(
                    Partition::new(elem.topic(), elem.partition()),
                    offset,
                )),
                _ => None,
            })
            .collect())
    }

    pub async fn health_check(&self) -> Result<()> {
        let metadata = self
            .consumer
            .fetch_metadata(Some(self.topic.as_str()), Duration::from_secs(10))
            .map_err(|e| KafkaError::HealthCheck {
                reason: e.to_string(),
            })?;

        let Some(topic_metadata) = metadata.topics().first() else {
            return Err(anyhow::anyhow!("Topic {} not found", self.topic));
        };
        if topic_metadata.partitions().is_empty() {
            return Err(anyhow::anyhow!(
                "No partitions found for topic {}",
                self.topic
            ));
        }

        info!(
            "Health check passed for topic {} with {} partitions",
            self.topic,
            topic_metadata.partitions().len()
        );

        Ok(())
    }

    pub fn unsubscribe(&self) {
        self.consumer.unsubscribe();
    }
}

fn convert_message(message: &BorrowedMessage<'_>) -> Record {
    let mut headers = Vec::new();
    if let Some(header_map) = message.headers() {
        for header in header_map.iter() {
            headers.push((
                header.key.to_string(),
                header.value.map(<[u8]>::to_vec).unwrap_or_default(),
            ));
        }
    }

    Record {
        topic: message.topic().to_string(),
        partition: message.partition(),
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec),
        // Tombstones carry no payload; they reach the decoder as an empty value.
        value: message.payload().map(<[u8]>::to_vec).unwrap_or_default(),
        timestamp: message
            .timestamp()
            .to_millis()
            .and_then(DateTime::from_timestamp_millis),
        headers,
    }
}

fn is_fatal_code(code: RDKafkaErrorCode) -> bool {
    matches!(
        code,
        RDKafkaErrorCode::Authentication
            | RDKafkaErrorCode::SaslAuthenticationFailed
            | RDKafkaErrorCode::TopicAuthorizationFailed
            | RDKafkaErrorCode::GroupAuthorizationFailed
            | RDKafkaErrorCode::ClusterAuthorizationFailed
            | RDKafkaErrorCode::Fatal
    )
}

/// Returns the error that should stop the worker, or `None` after logging a
/// transient one.
fn classify_consume_error(e: RdKafkaError) -> Option<SourceError> {
    match &e {
        RdKafkaError::MessageConsumptionFatal(code) => {
            error!("Fatal Kafka consumer error: {code:?}");
            Some(SourceError::Connection {
                reason: e.to_string(),
            })
        }
        RdKafkaError::MessageConsumption(RDKafkaErrorCode::PartitionEOF) => None,
        _ => match e.rdkafka_error_code() {
            Some(code) if is_fatal_code(code) => {
                error!("Kafka consumer cannot continue: {code:?}");
                Some(SourceError::Connection {
                    reason: e.to_string(),
                })
            }
            _ => {
                warn!("Error receiving message: {}", e);
                None
            }
        },
    }
}

fn classify_commit_error(e: RdKafkaError) -> SourceError {
    match e.rdkafka_error_code() {
        Some(code) if is_fatal_code(code) => SourceError::Connection {
            reason: e.to_string(),
        },
        _ => SourceError::Commit {
            reason: e.to_string(),
        },
    }
}

/// A single consumer-group member reading one topic.
pub struct KafkaSource {
    client: KafkaConsumerClient,
    events: mpsc::UnboundedReceiver<SourceEvent>,
}

impl KafkaSource {
    pub fn new(
        config: &KafkaOptions,
        topic: &str,
        consumer_group: &str,
        member: usize,
    ) -> std::result::Result<Self, KafkaError> {
        let (client, events) =
            KafkaConsumerClient::new(config, topic, consumer_group, &member.to_string())?;
        client.subscribe()?;

        Ok(Self { client, events })
    }

    pub fn client(&self) -> &KafkaConsumerClient {
        &self.client
    }

    fn drain_events(&mut self, into: &mut Vec<SourceEvent>) {
        while let Ok(event) = self.events.try_recv() {
            into.push(event);
        }
    }
}

#[async_trait]
impl Source for KafkaSource {
    async fn poll(
        &mut self,
        max_records: usize,
        timeout: Duration,
    ) -> std::result::Result<PolledBatch, SourceError> {
        let records = self.client.consume_batch(max_records, timeout).await?;

        let mut events = Vec::new();
        self.drain_events(&mut events);

        Ok(PolledBatch { records, events })
    }

    async fn commit(&self, offsets: &[PartitionOffset]) -> std::result::Result<(), SourceError> {
        self.client.commit_offsets(offsets)
    }

    async fn committed(
        &self,
        partitions: &[Partition],
    ) -> std::result::Result<Vec<PartitionOffset>, SourceError> {
        if partitions.is_empty() {
            return Ok(Vec::new());
        }
        self.client.committed_offsets(partitions)
    }

    async fn shutdown(&mut self) -> std::result::Result<(), SourceError> {
        self.client.unsubscribe();
        info!("Unsubscribed from Kafka topic: {}", self.client.topic);
        Ok(())
    }
}
