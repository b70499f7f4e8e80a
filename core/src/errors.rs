use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConsumeError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Source error: {0}")]
    Source(#[from] SourceError),

    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),

    #[error("Decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("Dead-letter error: {0}")]
    DeadLetter(#[from] SinkError),

    #[error("Generic error: {0}")]
    Generic(#[from] anyhow::Error),
}

/// Errors raised by a broker source while polling or committing.
#[derive(Error, Debug)]
pub enum SourceError {
    /// The broker cannot be used any more (authentication, fatal client state).
    #[error("Broker connection failed: {reason}")]
    Connection { reason: String },

    #[error("A transient error occurred, the operation can be retried: {reason}")]
    Transient { reason: String },

    /// The broker rejected an offset commit.
    #[error("Offset commit rejected: {reason}")]
    Commit { reason: String },
}

impl SourceError {
    /// Fatal errors move a worker to `Failed`; everything else is handled in the loop.
    pub fn is_fatal(&self) -> bool {
        matches!(self, SourceError::Connection { .. })
    }
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Configuration validation failed: {reason}")]
    ValidationFailed { reason: String },

    #[error("No handler registered under the name {name}")]
    UnknownHandler { name: String },

    #[error("Type {type_id} is not in the trusted type list")]
    UntrustedType { type_id: String },
}

#[derive(Error, Debug)]
pub enum KafkaError {
    #[error("Failed to create consumer: {reason}")]
    ConsumerCreation { reason: String },

    #[error("Failed to create producer: {reason}")]
    ProducerCreation { reason: String },

    #[error("Failed to subscribe to topic {topic}: {reason}")]
    Subscription { topic: String, reason: String },

    #[error("Consumer health check failed: {reason}")]
    HealthCheck { reason: String },
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("JSON decoding failed: {reason}")]
    Json { reason: String },

    #[error("Payload is not valid UTF-8: {reason}")]
    Utf8 { reason: String },

    #[error("Record type {found} is not trusted by a decoder for {expected}")]
    UntrustedType { found: String, expected: String },

    #[error("Record payload is empty")]
    Empty,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    #[error("Handler failed: {reason}")]
    Failed { reason: String },

    #[error("Handler exceeded its time limit of {0:?}")]
    Timeout(Duration),

    #[error("Handler panicked: {message}")]
    Panicked { message: String },
}

impl HandlerError {
    pub fn failed(reason: impl Into<String>) -> Self {
        HandlerError::Failed {
            reason: reason.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Failed to publish dead letter to {destination}: {reason}")]
    Publish { destination: String, reason: String },
}

pub type Result<T> = std::result::Result<T, ConsumeError>;

impl ConsumeError {
    pub fn get_retry_delay_ms(&self) -> u64 {
        match self {
            ConsumeError::Source(SourceError::Commit { .. }) => 500,
            ConsumeError::Source(_) | ConsumeError::Kafka(_) => 1000,
            ConsumeError::DeadLetter(_) => 2000,
            _ => 5000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_handler_display() {
        let error = ConfigError::UnknownHandler {
            name: "person-logger".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "No handler registered under the name person-logger"
        );
    }

    #[test]
    fn test_handler_timeout_display() {
        let error = HandlerError::Timeout(Duration::from_millis(250));
        assert_eq!(error.to_string(), "Handler exceeded its time limit of 250ms");
    }

    #[test]
    fn test_decode_error_display() {
        let error = DecodeError::UntrustedType {
            found: "com.example.Admin".to_string(),
            expected: "person".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Record type com.example.Admin is not trusted by a decoder for person"
        );
    }

    #[test]
    fn test_source_error_fatality() {
        assert!(SourceError::Connection {
            reason: "SASL authentication failed".to_string()
        }
        .is_fatal());
        assert!(!SourceError::Commit {
            reason: "REBALANCE_IN_PROGRESS".to_string()
        }
        .is_fatal());
        assert!(!SourceError::Transient {
            reason: "broker transport failure".to_string()
        }
        .is_fatal());
    }

    #[test]
    fn test_get_retry_delay_ms() {
        let test_cases = vec![
            (
                ConsumeError::Source(SourceError::Commit {
                    reason: "test".to_string(),
                }),
                500,
            ),
            (
                ConsumeError::Kafka(KafkaError::ConsumerCreation {
                    reason: "test".to_string(),
                }),
                1000,
            ),
            (ConsumeError::Decode(DecodeError::Empty), 5000),
        ];

        for (error, expected_delay) in test_cases {
            assert_eq!(error.get_retry_delay_ms(), expected_delay, "{:?}", error);
        }
    }

    #[test]
    fn test_error_chain_display() {
        let outer_error = ConsumeError::Config(ConfigError::MissingField {
            field: "bootstrap_servers".to_string(),
        });

        let error_string = outer_error.to_string();
        assert!(error_string.contains("Configuration error"));
        assert!(error_string.contains("Missing required field: bootstrap_servers"));
    }
}
