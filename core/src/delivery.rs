//! Retry, backoff and dead-letter routing for a single record.

use std::sync::Arc;
use std::time::Duration;

use tracing::{error, warn};

use crate::config::{DecodeFailurePolicy, FailurePolicy, ProcessingConfig, RetryConfig};
use crate::errors::ConsumeError;
use crate::handler::{ProcessOutcome, RecordProcessor};
use crate::record::Record;
use crate::sink::{DeadLetter, DeadLetterSink, FailureKind};

/// How long to wait between attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Coefficient to multiply initial_interval with for every past attempt.
    pub backoff_coefficient: u32,
    /// The backoff interval for the first retry.
    pub initial_interval: Duration,
    /// The maximum possible backoff between retries.
    pub maximum_interval: Option<Duration>,
    /// Retries after the first attempt.
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(backoff_coefficient: u32, initial_interval: Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval: None,
            max_retries: 0,
        }
    }

    pub fn with_maximum_interval(mut self, interval: Duration) -> Self {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Interval before retry number `attempt` (1-based).
    pub fn retry_interval(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_coefficient
            .saturating_pow(attempt.saturating_sub(1));
        let candidate_interval = self
            .initial_interval
            .checked_mul(factor)
            .unwrap_or(Duration::MAX);

        match self.maximum_interval {
            Some(max_interval) => std::cmp::min(candidate_interval, max_interval),
            None => candidate_interval,
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        let policy = RetryPolicy::new(
            config.backoff_coefficient,
            Duration::from_millis(config.initial_interval_ms),
        )
        .with_max_retries(config.max_retries);

        match config.max_interval_ms {
            Some(max) => policy.with_maximum_interval(Duration::from_millis(max)),
            None => policy,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::from(&RetryConfig::default())
    }
}

/// What became of a record. Both variants allow the offset to advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Handled { attempts: u32 },
    DeadLettered { kind: FailureKind, attempts: u32 },
}

impl Disposition {
    /// Handler invocations that returned an error.
    pub fn handler_failures(&self) -> u32 {
        match self {
            Disposition::Handled { attempts } => attempts.saturating_sub(1),
            Disposition::DeadLettered {
                kind: FailureKind::Handler,
                attempts,
            } => *attempts,
            Disposition::DeadLettered { .. } => 0,
        }
    }

    pub fn retries(&self) -> u32 {
        match self {
            Disposition::Handled { attempts } | Disposition::DeadLettered { attempts, .. } => {
                attempts.saturating_sub(1)
            }
        }
    }
}

pub struct DeliveryController {
    processor: Arc<dyn RecordProcessor>,
    sink: Arc<dyn DeadLetterSink>,
    retry: RetryPolicy,
    failure_policy: FailurePolicy,
    on_decode_failure: DecodeFailurePolicy,
    handler_timeout: Duration,
}

impl DeliveryController {
    pub fn new(
        processor: Arc<dyn RecordProcessor>,
        sink: Arc<dyn DeadLetterSink>,
        config: &ProcessingConfig,
    ) -> Self {
        Self {
            processor,
            sink,
            retry: RetryPolicy::from(&config.retry),
            failure_policy: config.failure_policy,
            on_decode_failure: config.on_decode_failure,
            handler_timeout: config.handler_timeout(),
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Decode and handle `record` until it is handled or dead-lettered.
    ///
    /// Decode failures are not retried. Returns an error only when the record
    /// could not be disposed of (decode failure with `on_decode_failure: fail`,
    /// or the dead-letter sink kept failing); the caller must not advance past it.
    pub async fn deliver(&self, record: &Record) -> Result<Disposition, ConsumeError> {
        let mut attempts = 0;

        loop {
            attempts += 1;
            match self.processor.process(record, self.handler_timeout).await {
                ProcessOutcome::Handled => return Ok(Disposition::Handled { attempts }),
                ProcessOutcome::DecodeFailed(e) => {
                    warn!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        error = %e,
                        "Failed to decode record"
                    );
                    if self.on_decode_failure == DecodeFailurePolicy::Fail {
                        return Err(ConsumeError::Decode(e));
                    }
                    self.dead_letter(DeadLetter {
                        record: record.clone(),
                        kind: FailureKind::Decode,
                        error: e.to_string(),
                        attempts: 0,
                    })
                    .await?;
                    return Ok(Disposition::DeadLettered {
                        kind: FailureKind::Decode,
                        attempts: 0,
                    });
                }
                ProcessOutcome::HandlerFailed(e) => {
                    let retries_left = self.failure_policy == FailurePolicy::RetryThenDeadLetter
                        && attempts <= self.retry.max_retries;

                    if retries_left {
                        let delay = self.retry.retry_interval(attempts);
                        warn!(
                            topic = %record.topic,
                            partition = record.partition,
                            offset = record.offset,
                            attempt = attempts,
                            error = %e,
                            "Handler failed, retrying in {:?}",
                            delay
                        );
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    error!(
                        topic = %record.topic,
                        partition = record.partition,
                        offset = record.offset,
                        attempts,
                        error = %e,
                        "Handler failed, sending record to dead-letter sink"
                    );
                    self.dead_letter(DeadLetter {
                        record: record.clone(),
                        kind: FailureKind::Handler,
                        error: e.to_string(),
                        attempts,
                    })
                    .await?;
                    return Ok(Disposition::DeadLettered {
                        kind: FailureKind::Handler,
                        attempts,
                    });
                }
            }
        }
    }

    async fn dead_letter(&self, letter: DeadLetter) -> Result<(), ConsumeError> {
        let mut attempt = 0;
        loop {
            match self.sink.send(&letter).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < self.retry.max_retries => {
                    attempt += 1;
                    let delay = self.retry.retry_interval(attempt);
                    warn!(
                        offset = letter.record.offset,
                        error = %e,
                        "Dead-letter publish failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    error!(
                        topic = %letter.record.topic,
                        partition = letter.record.partition,
                        offset = letter.record.offset,
                        error = %e,
                        "Dead-letter publish failed, giving up"
                    );
                    return Err(ConsumeError::DeadLetter(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{JsonCodec, Message, StringCodec};
    use crate::errors::{HandlerError, SinkError};
    use crate::handler::{handler_fn, Pipeline};
    use crate::sink::MockDeadLetterSink;
    use crate::sink::memory::MemoryDeadLetterSink;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn failing_processor(failures: u32, calls: Arc<AtomicU32>) -> Arc<dyn RecordProcessor> {
        Arc::new(Pipeline::new(
            StringCodec::new(),
            handler_fn(move |_: &Message<String>| -> Result<(), HandlerError> {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                if call < failures {
                    Err(HandlerError::failed("downstream unavailable"))
                } else {
                    Ok(())
                }
            }),
        ))
    }

    fn config(max_retries: u32) -> ProcessingConfig {
        ProcessingConfig {
            retry: RetryConfig {
                max_retries,
                initial_interval_ms: 100,
                backoff_coefficient: 2,
                max_interval_ms: Some(1000),
            },
            ..ProcessingConfig::default()
        }
    }

    #[test]
    fn test_retry_interval_grows_and_caps() {
        let policy = RetryPolicy::new(2, Duration::from_millis(100))
            .with_maximum_interval(Duration::from_millis(500));

        assert_eq!(policy.retry_interval(1), Duration::from_millis(100));
        assert_eq!(policy.retry_interval(2), Duration::from_millis(200));
        assert_eq!(policy.retry_interval(3), Duration::from_millis(400));
        assert_eq!(policy.retry_interval(4), Duration::from_millis(500));
        assert_eq!(policy.retry_interval(64), Duration::from_millis(500));
    }

    #[test]
    fn test_retry_policy_from_config() {
        let policy = RetryPolicy::from(&RetryConfig::default());
        assert_eq!(policy.max_retries, 3);
        assert_eq!(policy.initial_interval, Duration::from_secs(1));
        assert_eq!(policy.maximum_interval, Some(Duration::from_secs(30)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fail_once_handler_is_retried() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut sink = MockDeadLetterSink::new();
        sink.expect_send().never();

        let controller = DeliveryController::new(
            failing_processor(1, Arc::clone(&calls)),
            Arc::new(sink),
            &config(3),
        );

        let started = tokio::time::Instant::now();
        let disposition = controller
            .deliver(&Record::new("topic-1", 0, 3, "hello"))
            .await
            .unwrap();

        assert_eq!(disposition, Disposition::Handled { attempts: 2 });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), Duration::from_millis(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhausted_retries_dead_letter_exactly_once() {
        let calls = Arc::new(AtomicU32::new(0));
        let mut sink = MockDeadLetterSink::new();
        sink.expect_send()
            .times(1)
            .withf(|letter| {
                letter.kind == FailureKind::Handler
                    && letter.attempts == 4
                    && letter.record.offset == 9
            })
            .returning(|_| Ok(()));

        let controller = DeliveryController::new(
            failing_processor(u32::MAX, Arc::clone(&calls)),
            Arc::new(sink),
            &config(3),
        );

        let disposition = controller
            .deliver(&Record::new("topic-1", 0, 9, "hello"))
            .await
            .unwrap();

        assert_eq!(
            disposition,
            Disposition::DeadLettered {
                kind: FailureKind::Handler,
                attempts: 4
            }
        );
        assert_eq!(disposition.retries(), 3);
        assert_eq!(disposition.handler_failures(), 4);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_dead_letter_policy_skips_retries() {
        let calls = Arc::new(AtomicU32::new(0));
        let sink = MemoryDeadLetterSink::new();
        let controller = DeliveryController::new(
            failing_processor(u32::MAX, Arc::clone(&calls)),
            Arc::new(sink.clone()),
            &ProcessingConfig {
                failure_policy: FailurePolicy::DeadLetter,
                ..config(3)
            },
        );

        controller
            .deliver(&Record::new("topic-1", 0, 1, "hello"))
            .await
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test]
    async fn test_decode_failure_goes_straight_to_dead_letter() {
        let sink = MemoryDeadLetterSink::new();
        let controller = DeliveryController::new(
            Arc::new(Pipeline::new(
                JsonCodec::<serde_json::Value>::new("json"),
                handler_fn(|_: &Message<serde_json::Value>| Ok(())),
            )),
            Arc::new(sink.clone()),
            &config(3),
        );

        let disposition = controller
            .deliver(&Record::new("topic-1", 0, 7, "{not json"))
            .await
            .unwrap();

        assert_eq!(
            disposition,
            Disposition::DeadLettered {
                kind: FailureKind::Decode,
                attempts: 0
            }
        );
        let letters = sink.letters();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].kind, FailureKind::Decode);
        assert_eq!(letters[0].record.offset, 7);
    }

    #[tokio::test]
    async fn test_decode_failure_can_stop_the_worker() {
        let controller = DeliveryController::new(
            Arc::new(Pipeline::new(
                JsonCodec::<serde_json::Value>::new("json"),
                handler_fn(|_: &Message<serde_json::Value>| Ok(())),
            )),
            Arc::new(MemoryDeadLetterSink::new()),
            &ProcessingConfig {
                on_decode_failure: DecodeFailurePolicy::Fail,
                ..config(3)
            },
        );

        let result = controller.deliver(&Record::new("topic-1", 0, 7, "")).await;
        assert!(matches!(result, Err(ConsumeError::Decode(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dead_letter_failure_is_reported() {
        let mut sink = MockDeadLetterSink::new();
        sink.expect_send().times(3).returning(|_| {
            Err(SinkError::Publish {
                destination: "topic-1.DLT".to_string(),
                reason: "broker unavailable".to_string(),
            })
        });

        let controller = DeliveryController::new(
            failing_processor(u32::MAX, Arc::new(AtomicU32::new(0))),
            Arc::new(sink),
            &ProcessingConfig {
                failure_policy: FailurePolicy::DeadLetter,
                ..config(2)
            },
        );

        let result = controller.deliver(&Record::new("topic-1", 0, 1, "hello")).await;
        assert!(matches!(result, Err(ConsumeError::DeadLetter(_))));
    }
}
