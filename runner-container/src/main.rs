use anyhow::{Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use consume_core::config::load_config;
use consume_core::telemetry::init_tracing;
use consume_core::ConsumerService;

mod handlers;

/// This is the entry point for running long-running Kafka listeners on container
/// hosting services like AWS EKS, ECS, etc.
///
/// What it does at a high-level:
///     Load config from the path given as the first argument, or from `CONSUMER_CONFIG`.
///     Start every configured listener with the handlers registered in `handlers`.
///     Run until SIGTERM/SIGINT or a fatal broker error, then drain and commit.
#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config_path = std::env::args().nth(1);
    let config = load_config(config_path.as_deref())
        .await
        .context("Failed to load consumer configuration")?;

    let mut term = signal(SignalKind::terminate()).context("Failed to register SIGTERM handler")?;
    let mut interrupt =
        signal(SignalKind::interrupt()).context("Failed to register SIGINT handler")?;

    let registry = handlers::registry();
    let service = ConsumerService::start(&config, &registry)
        .await
        .context("Failed to start listeners")?;

    let report = service
        .run_until(async {
            tokio::select! {
                _ = term.recv() => {},
                _ = interrupt.recv() => {},
            }
            info!("Shutting down gracefully...");
        })
        .await;

    if report.aborted > 0 {
        info!("{} workers were aborted at the shutdown deadline", report.aborted);
    }

    let metrics = report.into_result().context("Listener stopped with an error")?;
    info!(
        records = metrics.total_records,
        handled = metrics.handled_records,
        retries = metrics.retries,
        dead_lettered = metrics.dead_lettered,
        skipped = metrics.skipped_records,
        commits = metrics.commits,
        "Consumer stopped"
    );
    Ok(())
}
