mod batch;
mod engine;

use sandrun_common::redis::RedisBackend;
use sandrun_common::Config;
use sandrun_engine::Orchestrator;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::batch::Worker;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Sandrun worker booting");

    let config = Config::from_env();
    tokio::fs::create_dir_all(&config.scratch_dir).await?;

    let backend = Arc::new(RedisBackend::open(
        &config.redis_url,
        Duration::from_secs(config.status_ttl_secs),
        Duration::from_secs(config.blob_ttl_secs),
    )?);

    // The connection manager retries on its own; a cold Redis only delays the first batch
    match backend.ping().await {
        Ok(()) => info!(redis_url = %config.redis_url, "Redis reachable"),
        Err(e) => warn!(redis_url = %config.redis_url, error = %e, "Redis not reachable yet"),
    }

    let worker = Arc::new(
        Worker::new(
            Arc::new(Orchestrator::from_config(&config)),
            backend.clone(),
            backend.clone(),
        )
        .with_concurrency(config.worker_concurrency),
    );

    info!(
        scratch_dir = %config.scratch_dir.display(),
        batch_size = config.batch_size,
        concurrency = config.worker_concurrency,
        "Worker configured"
    );

    let (stop, shutdown) = watch::channel(false);
    tokio::spawn(async move {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            return;
        }
        info!("Received shutdown signal, draining current batch");
        let _ = stop.send(true);
    });

    let poll_timeout = Duration::from_secs_f64(config.poll_timeout_secs.max(0.0));
    worker
        .run_loop(backend, config.batch_size, poll_timeout, shutdown)
        .await;

    info!("Worker shutdown complete");
    Ok(())
}
