use serde::Serialize;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub const DEFAULT_LOG_FILTER: &str = "consume_core=info,runner_container=info";

pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| DEFAULT_LOG_FILTER.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Counters kept by each worker and summed by the service on shutdown.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct ConsumeMetrics {
    pub total_records: usize,
    pub handled_records: usize,
    pub retries: usize,
    pub decode_failures: usize,
    pub handler_failures: usize,
    pub dead_lettered: usize,
    /// Records consumed but neither handled nor dead-lettered (at-most-once pre-commit failures).
    pub skipped_records: usize,
    pub commits: usize,
    pub commit_failures: usize,
    pub batches_processed: usize,
    pub bytes_processed: u64,
}

impl ConsumeMetrics {
    pub fn merge(&mut self, other: &ConsumeMetrics) {
        self.total_records += other.total_records;
        self.handled_records += other.handled_records;
        self.retries += other.retries;
        self.decode_failures += other.decode_failures;
        self.handler_failures += other.handler_failures;
        self.dead_lettered += other.dead_lettered;
        self.skipped_records += other.skipped_records;
        self.commits += other.commits;
        self.commit_failures += other.commit_failures;
        self.batches_processed += other.batches_processed;
        self.bytes_processed += other.bytes_processed;
    }

    pub fn avg_batch_size(&self) -> f64 {
        if self.batches_processed == 0 {
            return 0.0;
        }
        self.total_records as f64 / self.batches_processed as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_sums_counters() {
        let mut total = ConsumeMetrics {
            total_records: 3,
            handled_records: 2,
            dead_lettered: 1,
            batches_processed: 1,
            bytes_processed: 30,
            ..Default::default()
        };
        total.merge(&ConsumeMetrics {
            total_records: 5,
            handled_records: 5,
            commits: 2,
            batches_processed: 3,
            bytes_processed: 12,
            ..Default::default()
        });

        assert_eq!(total.total_records, 8);
        assert_eq!(total.handled_records, 7);
        assert_eq!(total.dead_lettered, 1);
        assert_eq!(total.commits, 2);
        assert_eq!(total.bytes_processed, 42);
        assert_eq!(total.avg_batch_size(), 2.0);
    }

    #[test]
    fn test_metrics_serialize() {
        let json = serde_json::to_value(ConsumeMetrics::default()).unwrap();
        assert_eq!(json["dead_lettered"], 0);
        assert_eq!(json["commit_failures"], 0);
    }
}
