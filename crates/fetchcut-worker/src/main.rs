//! Acquisition worker binary.

use std::sync::Arc;

use anyhow::Context;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use fetchcut_media::ProgressRelay;
use fetchcut_queue::{JobStore, JsonFileStore, Scheduler, SchedulerConfig};
use fetchcut_worker::{spawn_progress_sink, Pipeline, WorkerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Colored output for dev, JSON for production
    let use_json = std::env::var("LOG_FORMAT")
        .map(|v| v.to_lowercase() == "json")
        .unwrap_or(false);

    let env_filter = EnvFilter::from_default_env()
        .add_directive("fetchcut=info".parse().expect("static directive"));

    if use_json {
        tracing_subscriber::registry()
            .with(fmt::layer().json())
            .with(env_filter)
            .init();
    } else {
        tracing_subscriber::registry()
            .with(
                fmt::layer()
                    .with_ansi(true)
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_file(false)
                    .with_line_number(false),
            )
            .with(env_filter)
            .init();
    }

    info!("Starting fetchcut-worker");

    let config = WorkerConfig::from_env();
    info!("Worker config: {:?}", config);

    let store: Arc<dyn JobStore> = Arc::new(
        JsonFileStore::open(&config.state_file)
            .await
            .context("failed to open job store")?,
    );

    let relay = ProgressRelay::new();
    let _progress_sink = spawn_progress_sink(&relay, store.clone());

    let pipeline = Pipeline::new(&config, relay).context("failed to build pipeline")?;
    let scheduler = Arc::new(Scheduler::new(
        store,
        Arc::new(pipeline),
        SchedulerConfig {
            max_concurrent: config.max_concurrent_jobs,
            tick_interval: config.claim_interval,
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_handle = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!("Received shutdown signal");
    let _ = shutdown_tx.send(true);

    scheduler_handle.await.context("scheduler task panicked")?;
    info!("Worker shutdown complete");
    Ok(())
}
