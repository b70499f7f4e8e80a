use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::errors::ConfigError;

pub const CONFIG_ENV_VAR: &str = "CONSUMER_CONFIG";

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ConsumeConfig {
    pub version: u32,
    pub kafka: KafkaOptions,
    /// Type ids decoders are allowed to produce. Anything else is rejected at startup.
    #[serde(default)]
    pub trusted_types: Vec<String>,
    pub listeners: Vec<ListenerConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct KafkaOptions {
    pub bootstrap_servers: String,
    pub client_id: Option<String>,
    pub security_protocol: Option<String>,
    pub sasl_mechanisms: Option<String>,
    pub sasl_username: Option<String>,
    pub sasl_password: Option<String>,
    pub ssl_ca_location: Option<String>,
    pub auto_offset_reset: Option<String>,
    pub session_timeout_ms: Option<u32>,
    pub heartbeat_interval_ms: Option<u32>,
}

/// One topic/group pair bound to a registered handler.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ListenerConfig {
    pub name: String,
    pub topic: String,
    pub consumer_group: String,
    pub handler: String,
    /// Number of workers (group members) for this listener.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub processing: ProcessingConfig,
}

fn default_concurrency() -> usize {
    1
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Commit only after the handler has returned.
    #[default]
    AtLeastOnce,
    /// Commit before the handler runs.
    AtMostOnce,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitPolicy {
    #[default]
    PerBatch,
    PerRecord,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    #[default]
    RetryThenDeadLetter,
    DeadLetter,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeFailurePolicy {
    #[default]
    DeadLetter,
    /// Stop the worker without advancing past the record.
    Fail,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub initial_interval_ms: u64,
    pub backoff_coefficient: u32,
    pub max_interval_ms: Option<u64>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_interval_ms: 1000,
            backoff_coefficient: 2,
            max_interval_ms: Some(30000),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub max_poll_records: usize,
    pub poll_timeout_ms: u64,
    pub handler_timeout_ms: u64,
    pub delivery: DeliveryMode,
    pub commit_policy: CommitPolicy,
    pub failure_policy: FailurePolicy,
    pub on_decode_failure: DecodeFailurePolicy,
    pub retry: RetryConfig,
    pub dead_letter_topic: Option<String>,
    pub shutdown_timeout_ms: u64,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            max_poll_records: 500,
            poll_timeout_ms: 1000,
            handler_timeout_ms: 30000,
            delivery: DeliveryMode::default(),
            commit_policy: CommitPolicy::default(),
            failure_policy: FailurePolicy::default(),
            on_decode_failure: DecodeFailurePolicy::default(),
            retry: RetryConfig::default(),
            dead_letter_topic: None,
            shutdown_timeout_ms: 30000,
        }
    }
}

impl ProcessingConfig {
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }
}

pub async fn load_config(config_path: Option<&str>) -> anyhow::Result<ConsumeConfig> {
    match config_path {
        Some(path) => ConsumeConfig::from_file(path),
        None => ConsumeConfig::from_env(),
    }
}

impl ConsumeConfig {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    pub fn from_env() -> anyhow::Result<Self> {
        let config_str = std::env::var(CONFIG_ENV_VAR)
            .map_err(|_| anyhow::anyhow!("{} environment variable not set", CONFIG_ENV_VAR))?;
        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: ConsumeConfig = serde_yaml::from_str(content)?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.kafka.bootstrap_servers.is_empty() {
            return Err(invalid("Kafka bootstrap servers cannot be empty"));
        }
        if self.listeners.is_empty() {
            return Err(invalid("At least one listener must be configured"));
        }

        let mut names = HashSet::new();
        for listener in &self.listeners {
            if !names.insert(listener.name.as_str()) {
                return Err(invalid(format!("Duplicate listener name {}", listener.name)));
            }
            if listener.topic.is_empty() {
                return Err(invalid(format!("Listener {} has an empty topic", listener.name)));
            }
            if listener.consumer_group.is_empty() {
                return Err(invalid(format!(
                    "Listener {} has an empty consumer group",
                    listener.name
                )));
            }
            if listener.handler.is_empty() {
                return Err(ConfigError::MissingField {
                    field: format!("listeners.{}.handler", listener.name),
                });
            }
            if listener.concurrency == 0 {
                return Err(invalid(format!(
                    "Listener {} must run at least one worker",
                    listener.name
                )));
            }

            let processing = &listener.processing;
            if processing.max_poll_records == 0 {
                return Err(invalid("max_poll_records must be greater than zero"));
            }
            if processing.poll_timeout_ms == 0 {
                return Err(invalid("poll_timeout_ms must be greater than zero"));
            }
            if processing.handler_timeout_ms == 0 {
                return Err(invalid("handler_timeout_ms must be greater than zero"));
            }
            if processing.retry.backoff_coefficient == 0 {
                return Err(invalid("retry.backoff_coefficient must be at least 1"));
            }
            if processing.dead_letter_topic.as_deref() == Some(listener.topic.as_str()) {
                return Err(invalid(format!(
                    "Listener {} cannot dead-letter into its own topic",
                    listener.name
                )));
            }
        }
        Ok(())
    }

    pub fn is_trusted(&self, type_id: &str) -> bool {
        self.trusted_types.iter().any(|trusted| trusted == type_id)
    }

    pub fn listener(&self, name: &str) -> Option<&ListenerConfig> {
        self.listeners.iter().find(|listener| listener.name == name)
    }

    /// Longest drain window across listeners.
    pub fn shutdown_timeout(&self) -> Duration {
        self.listeners
            .iter()
            .map(|listener| listener.processing.shutdown_timeout())
            .max()
            .unwrap_or_else(|| ProcessingConfig::default().shutdown_timeout())
    }
}

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::ValidationFailed {
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_CONFIG: &str = include_str!("../../configs/consumer.yaml");

    #[test]
    fn test_parse_sample_config_file() {
        let config = ConsumeConfig::from_yaml(SAMPLE_CONFIG).unwrap();

        assert_eq!(config.version, 1);
        assert_eq!(config.kafka.bootstrap_servers, "localhost:9092");
        assert_eq!(config.listeners.len(), 2);
        assert!(config.is_trusted("person"));
        assert!(!config.is_trusted("com.example.Admin"));

        let person = config.listener("person-listener").unwrap();
        assert_eq!(person.topic, "topic-1");
        assert_eq!(person.consumer_group, "person-group");
        assert_eq!(config.listener("string-listener").unwrap().consumer_group, "group-2");
        assert_eq!(person.handler, "person-logger");
        assert_eq!(person.processing.delivery, DeliveryMode::AtLeastOnce);
        assert_eq!(person.processing.dead_letter_topic.as_deref(), Some("topic-1.DLT"));

        config.validate().unwrap();
    }

    #[test]
    fn test_processing_defaults_apply_to_missing_fields() {
        let config = ConsumeConfig::from_yaml(
            r#"
version: 1
kafka:
  bootstrap_servers: localhost:9092
listeners:
  - name: strings
    topic: topic-1
    consumer_group: group-1
    handler: string-logger
    processing:
      max_poll_records: 10
      retry:
        max_retries: 5
"#,
        )
        .unwrap();

        let listener = &config.listeners[0];
        assert_eq!(listener.concurrency, 1);
        assert_eq!(listener.processing.max_poll_records, 10);
        assert_eq!(listener.processing.poll_timeout_ms, 1000);
        assert_eq!(listener.processing.retry.max_retries, 5);
        assert_eq!(listener.processing.retry.initial_interval_ms, 1000);
        assert_eq!(listener.processing.commit_policy, CommitPolicy::PerBatch);
        assert_eq!(
            listener.processing.failure_policy,
            FailurePolicy::RetryThenDeadLetter
        );
        assert_eq!(
            listener.processing.on_decode_failure,
            DecodeFailurePolicy::DeadLetter
        );
        assert!(config.trusted_types.is_empty());
    }

    #[test]
    fn test_policy_names_parse() {
        let processing: ProcessingConfig = serde_yaml::from_str(
            r#"
delivery: at_most_once
commit_policy: per_record
failure_policy: dead_letter
on_decode_failure: fail
"#,
        )
        .unwrap();

        assert_eq!(processing.delivery, DeliveryMode::AtMostOnce);
        assert_eq!(processing.commit_policy, CommitPolicy::PerRecord);
        assert_eq!(processing.failure_policy, FailurePolicy::DeadLetter);
        assert_eq!(processing.on_decode_failure, DecodeFailurePolicy::Fail);
    }

    #[test]
    fn test_validate_rejects_bad_listeners() {
        let base = ConsumeConfig::from_yaml(SAMPLE_CONFIG).unwrap();

        let mut no_listeners = base.clone();
        no_listeners.listeners.clear();
        assert!(no_listeners.validate().is_err());

        let mut duplicate = base.clone();
        let copy = duplicate.listeners[0].clone();
        duplicate.listeners.push(copy);
        assert!(duplicate.validate().is_err());

        let mut zero_workers = base.clone();
        zero_workers.listeners[0].concurrency = 0;
        assert!(zero_workers.validate().is_err());

        let mut zero_poll_timeout = base.clone();
        zero_poll_timeout.listeners[1].processing.poll_timeout_ms = 0;
        assert!(matches!(
            zero_poll_timeout.validate(),
            Err(ConfigError::ValidationFailed { .. })
        ));

        let mut zero_handler_timeout = base.clone();
        zero_handler_timeout.listeners[0].processing.handler_timeout_ms = 0;
        assert!(zero_handler_timeout.validate().is_err());

        let mut self_dead_letter = base.clone();
        self_dead_letter.listeners[0].processing.dead_letter_topic =
            Some(self_dead_letter.listeners[0].topic.clone());
        assert!(self_dead_letter.validate().is_err());

        let mut missing_handler = base;
        missing_handler.listeners[0].handler.clear();
        assert!(matches!(
            missing_handler.validate(),
            Err(ConfigError::MissingField { .. })
        ));
    }

    #[test]
    fn test_shutdown_timeout_is_longest_listener_window() {
        let mut config = ConsumeConfig::from_yaml(SAMPLE_CONFIG).unwrap();
        config.listeners[0].processing.shutdown_timeout_ms = 1000;
        config.listeners[1].processing.shutdown_timeout_ms = 4000;
        assert_eq!(config.shutdown_timeout(), Duration::from_secs(4));
    }

    #[test]
    fn test_from_file_missing_path_fails() {
        assert!(ConsumeConfig::from_file("does/not/exist.yaml").is_err());
    }
}
