use std::time::Duration;

use async_trait::async_trait;
use rdkafka::ClientConfig;
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use tracing::{debug, info};

use crate::config::KafkaOptions;
use crate::errors::{KafkaError, SinkError};
use crate::sink::{DeadLetter, DeadLetterSink};

pub const ORIGINAL_TOPIC_HEADER: &str = "dlt-original-topic";
pub const ORIGINAL_PARTITION_HEADER: &str = "dlt-original-partition";
pub const ORIGINAL_OFFSET_HEADER: &str = "dlt-original-offset";
pub const FAILURE_KIND_HEADER: &str = "dlt-failure-kind";
pub const EXCEPTION_MESSAGE_HEADER: &str = "dlt-exception-message";
pub const ATTEMPTS_HEADER: &str = "dlt-attempts";

/// Publishes dead letters to a Kafka topic, keeping the original key and payload.
/// The producer is safe to share between workers.
pub struct KafkaDeadLetterSink {
    producer: FutureProducer,
    topic: String,
    send_timeout: Duration,
}

impl KafkaDeadLetterSink {
    pub fn new(config: &KafkaOptions, topic: &str) -> Result<Self, KafkaError> {
        let mut client_config = ClientConfig::new();

        client_config
            .set("bootstrap.servers", &config.bootstrap_servers)
            .set("message.timeout.ms", "30000")
            .set("enable.idempotence", "true");

        if let Some(client_id) = &config.client_id {
            client_config.set("client.id", format!("{client_id}-dlt"));
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

        let producer: FutureProducer = client_config
            .create()
            .map_err(|e| KafkaError::ProducerCreation {
                reason: e.to_string(),
            })?;

        info!("Dead-letter records will be published to {}", topic);

        Ok(Self {
            producer,
            topic: topic.to_string(),
            send_timeout: Duration::from_secs(10),
        })
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

fn dead_letter_headers(letter: &DeadLetter) -> OwnedHeaders {
    let partition = letter.record.partition.to_string();
    let offset = letter.record.offset.to_string();
    let attempts = letter.attempts.to_string();

    let mut headers = OwnedHeaders::new();
    for (key, value) in &letter.record.headers {
        headers = headers.insert(Header {
            key: key.as_str(),
            value: Some(value.as_slice()),
        });
    }

    headers
        .insert(Header {
            key: ORIGINAL_TOPIC_HEADER,
            value: Some(letter.record.topic.as_str()),
        })
        .insert(Header {
            key: ORIGINAL_PARTITION_HEADER,
            value: Some(partition.as_str()),
        })
        .insert(Header {
            key: ORIGINAL_OFFSET_HEADER,
            value: Some(offset.as_str()),
        })
        .insert(Header {
            key: FAILURE_KIND_HEADER,
            value: Some(letter.kind.as_str()),
        })
        .insert(Header {
            key: EXCEPTION_MESSAGE_HEADER,
            value: Some(letter.error.as_str()),
        })
        .insert(Header {
            key: ATTEMPTS_HEADER,
            value: Some(attempts.as_str()),
        })
}

#[async_trait]
impl DeadLetterSink for KafkaDeadLetterSink {
    async fn send(&self, letter: &DeadLetter) -> Result<(), SinkError> {
        let mut record: FutureRecord<'_, [u8], [u8]> = FutureRecord::to(&self.topic)
            .payload(letter.record.value.as_slice())
            .headers(dead_letter_headers(letter));

        if let Some(key) = &letter.record.key {
            record = record.key(key.as_slice());
        }

        self.producer
            .send(record, self.send_timeout)
            .await
            .map_err(|(e, _)| SinkError::Publish {
                destination: self.topic.clone(),
                reason: e.to_string(),
            })?;

        debug!(
            "Dead-lettered {}-{}@{} to {}",
            letter.record.topic, letter.record.partition, letter.record.offset, self.topic
        );
        Ok(())
    }
}
