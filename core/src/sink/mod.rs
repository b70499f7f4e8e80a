pub mod kafka;
pub mod memory;

use async_trait::async_trait;
use serde::Serialize;
use tracing::error;

use crate::errors::SinkError;
use crate::record::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Decode,
    Handler,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::Decode => "decode",
            FailureKind::Handler => "handler",
        }
    }
}

/// A record that could not be processed, with the reason it was given up on.
#[derive(Debug, Clone, PartialEq)]
pub struct DeadLetter {
    pub record: Record,
    pub kind: FailureKind,
    pub error: String,
    /// Handler invocations made before giving up (0 for decode failures).
    pub attempts: u32,
}

/// The `DeadLetterSink` trait defines the destination for records that exhaust retries.
/// A successful `send` means the record may be committed past.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn send(&self, letter: &DeadLetter) -> Result<(), SinkError>;
}

/// Records the failure in the log only. Used when no dead-letter topic is configured.
#[derive(Debug, Default, Clone)]
pub struct LogDeadLetterSink;

#[async_trait]
impl DeadLetterSink for LogDeadLetterSink {
    async fn send(&self, letter: &DeadLetter) -> Result<(), SinkError> {
        error!(
            topic = %letter.record.topic,
            partition = letter.record.partition,
            offset = letter.record.offset,
            kind = letter.kind.as_str(),
            attempts = letter.attempts,
            error = %letter.error,
            "Giving up on record"
        );
        Ok(())
    }
}
