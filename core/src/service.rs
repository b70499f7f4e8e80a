use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinSet};
use tracing::{info, info_span, warn, Instrument};

use crate::config::{ConsumeConfig, KafkaOptions, ListenerConfig};
use crate::delivery::DeliveryController;
use crate::errors::ConsumeError;
use crate::handler::HandlerRegistry;
use crate::sink::kafka::KafkaDeadLetterSink;
use crate::sink::{DeadLetterSink, LogDeadLetterSink};
use crate::source::kafka::{KafkaConsumerClient, KafkaSource};
use crate::source::Source;
use crate::telemetry::ConsumeMetrics;
use crate::worker::{LoopState, Worker, WorkerReport, WorkerSettings};

/// Outcome of a service run, collected from every worker.
#[derive(Debug, Default)]
pub struct ServiceReport {
    pub metrics: ConsumeMetrics,
    pub workers: Vec<WorkerReport>,
    /// Workers that did not stop within the shutdown timeout.
    pub aborted: usize,
    /// Worker tasks that panicked outside handler dispatch.
    pub crashed: Vec<String>,
}

impl ServiceReport {
    pub fn failed_workers(&self) -> impl Iterator<Item = &WorkerReport> {
        self.workers
            .iter()
            .filter(|report| report.state == LoopState::Failed)
    }

    /// The first fatal worker error, if any, or the merged metrics.
    pub fn into_result(mut self) -> Result<ConsumeMetrics, ConsumeError> {
        if let Some(error) = self.workers.iter_mut().find_map(|report| report.error.take()) {
            return Err(error);
        }
        if let Some(crash) = self.crashed.first() {
            return Err(anyhow::anyhow!("Worker task crashed: {crash}").into());
        }
        Ok(self.metrics)
    }
}

/// Runs the workers of every configured listener and stops them together.
pub struct ConsumerService {
    shutdown_tx: watch::Sender<bool>,
    workers: JoinSet<WorkerReport>,
    shutdown_timeout: Duration,
}

impl ConsumerService {
    pub fn new(shutdown_timeout: Duration) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            shutdown_tx,
            workers: JoinSet::new(),
            shutdown_timeout,
        }
    }

    /// Connects every listener to Kafka and starts `concurrency` workers for each.
    pub async fn start(config: &ConsumeConfig, registry: &HandlerRegistry) -> Result<Self, ConsumeError> {
        config.validate()?;

        for listener in &config.listeners {
            let (probe, _) =
                KafkaConsumerClient::new(&config.kafka, &listener.topic, &listener.consumer_group, "probe")?;
            if let Err(e) = probe.health_check().await {
                warn!(listener = %listener.name, "Kafka health check failed: {:#}", e);
            }
        }

        let kafka = config.kafka.clone();
        Self::start_with(
            config,
            registry,
            |listener, worker_id| {
                Ok(KafkaSource::new(
                    &kafka,
                    &listener.topic,
                    &listener.consumer_group,
                    worker_id,
                )?)
            },
            |listener| dead_letter_sink(&kafka, listener),
        )
    }

    /// Builds workers with caller-supplied sources and dead-letter sinks.
    ///
    /// Every handler is resolved before any worker starts, so an unknown or
    /// untrusted handler leaves nothing running.
    pub fn start_with<S, F, G>(
        config: &ConsumeConfig,
        registry: &HandlerRegistry,
        mut source_for: F,
        mut sink_for: G,
    ) -> Result<Self, ConsumeError>
    where
        S: Source + 'static,
        F: FnMut(&ListenerConfig, usize) -> Result<S, ConsumeError>,
        G: FnMut(&ListenerConfig) -> Result<Arc<dyn DeadLetterSink>, ConsumeError>,
    {
        config.validate()?;

        let mut resolved = Vec::with_capacity(config.listeners.len());
        for listener in &config.listeners {
            let processor = registry.resolve(&listener.handler, &config.trusted_types)?;
            resolved.push((listener, processor));
        }

        let mut service = Self::new(config.shutdown_timeout());
        for (listener, processor) in resolved {
            let sink = sink_for(listener)?;
            for worker_id in 0..listener.concurrency {
                let delivery = DeliveryController::new(
                    Arc::clone(&processor),
                    Arc::clone(&sink),
                    &listener.processing,
                );
                let worker = Worker::new(
                    WorkerSettings::from_listener(listener, worker_id),
                    source_for(listener, worker_id)?,
                    delivery,
                );
                service.spawn(&listener.name, worker_id, worker);
            }
            info!(
                listener = %listener.name,
                topic = %listener.topic,
                group = %listener.consumer_group,
                workers = listener.concurrency,
                "Listener started"
            );
        }
        Ok(service)
    }

    pub fn spawn<S>(&mut self, listener: &str, worker_id: usize, worker: Worker<S>)
    where
        S: Source + 'static,
    {
        let span = info_span!("worker", listener = %listener, id = worker_id);
        self.workers
            .spawn(worker.run(self.shutdown_tx.subscribe()).instrument(span));
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Runs until `signal` completes or a worker fails, then shuts everything down.
    pub async fn run_until<F>(mut self, signal: F) -> ServiceReport
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(signal);
        let mut finished = Vec::new();
        let mut crashed = Vec::new();

        loop {
            tokio::select! {
                _ = &mut signal => {
                    info!("Shutdown signal received");
                    break;
                }
                joined = self.workers.join_next() => match joined {
                    None => break,
                    Some(joined) => {
                        let failed = match collect(joined, &mut finished, &mut crashed) {
                            Some(state) => state == LoopState::Failed,
                            None => true,
                        };
                        if failed {
                            warn!("A worker stopped with an error, shutting down");
                            break;
                        }
                    }
                }
            }
        }

        self.drain(finished, crashed).await
    }

    /// Signals every worker to stop and waits up to the shutdown timeout.
    pub async fn shutdown(self) -> ServiceReport {
        self.drain(Vec::new(), Vec::new()).await
    }

    async fn drain(mut self, mut finished: Vec<WorkerReport>, mut crashed: Vec<String>) -> ServiceReport {
        self.shutdown_tx.send_replace(true);
        info!(
            "Stopping {} workers, waiting up to {:?}",
            self.workers.len(),
            self.shutdown_timeout
        );

        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while let Some(joined) = self.workers.join_next().await {
                collect(joined, &mut finished, &mut crashed);
            }
        })
        .await;

        let mut aborted = 0;
        if drained.is_err() {
            aborted = self.workers.len();
            warn!("{} workers did not stop in time, aborting", aborted);
            self.workers.abort_all();
            while self.workers.join_next().await.is_some() {}
        }

        let mut metrics = ConsumeMetrics::default();
        for report in &finished {
            metrics.merge(&report.metrics);
        }
        info!(
            records = metrics.total_records,
            handled = metrics.handled_records,
            dead_lettered = metrics.dead_lettered,
            commits = metrics.commits,
            "Consumer service stopped"
        );

        ServiceReport {
            metrics,
            workers: finished,
            aborted,
            crashed,
        }
    }
}

fn collect(
    joined: Result<WorkerReport, JoinError>,
    finished: &mut Vec<WorkerReport>,
    crashed: &mut Vec<String>,
) -> Option<LoopState> {
    match joined {
        Ok(report) => {
            let state = report.state;
            finished.push(report);
            Some(state)
        }
        Err(e) => {
            warn!("Worker task ended abnormally: {}", e);
            crashed.push(e.to_string());
            None
        }
    }
}

fn dead_letter_sink(
    kafka: &KafkaOptions,
    listener: &ListenerConfig,
) -> Result<Arc<dyn DeadLetterSink>, ConsumeError> {
    match &listener.processing.dead_letter_topic {
        Some(topic) => Ok(Arc::new(KafkaDeadLetterSink::new(kafka, topic)?)),
        None => {
            info!(
                listener = %listener.name,
                "No dead-letter topic configured, failed records will be logged"
            );
            Ok(Arc::new(LogDeadLetterSink))
        }
    }
}
