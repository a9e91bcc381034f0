mod handlers;
mod metrics;
mod routes;

use axum::Router;
use sandrun_common::guard::SubmissionGuard;
use sandrun_common::redis::RedisBackend;
use sandrun_common::store::{BlobStore, JobQueue, StatusStore};
use sandrun_common::Config;
use sandrun_engine::Orchestrator;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

pub struct AppState {
    pub status: Arc<dyn StatusStore>,
    pub blobs: Arc<dyn BlobStore>,
    pub queue: Arc<dyn JobQueue>,
    pub guard: SubmissionGuard,
    /// Runs `/run` requests in-process
    pub orchestrator: Arc<Orchestrator>,
    pub sync_deadline: Duration,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(
        config: &Config,
        status: Arc<dyn StatusStore>,
        blobs: Arc<dyn BlobStore>,
        queue: Arc<dyn JobQueue>,
        orchestrator: Arc<Orchestrator>,
    ) -> Self {
        Self {
            status,
            blobs,
            queue,
            guard: SubmissionGuard::new(config.max_code_chars, config.structure_check),
            orchestrator,
            sync_deadline: Duration::from_millis(config.sync_deadline_ms),
            start_time: Instant::now(),
        }
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("LOG_FORMAT")
        .map(|format| format.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if json {
        tracing_subscriber::fmt().json().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();
    init_tracing();

    info!("Sandrun API booting");

    metrics::init_metrics();
    info!("Metrics registry initialized");

    let config = Config::from_env();
    tokio::fs::create_dir_all(&config.scratch_dir).await?;

    let backend = Arc::new(RedisBackend::open(
        &config.redis_url,
        Duration::from_secs(config.status_ttl_secs),
        Duration::from_secs(config.blob_ttl_secs),
    )?);

    match backend.ping().await {
        Ok(()) => info!(redis_url = %config.redis_url, "Connected to Redis"),
        Err(e) => warn!(redis_url = %config.redis_url, error = %e, "Redis not reachable yet"),
    }

    let state = Arc::new(AppState::new(
        &config,
        backend.clone(),
        backend.clone(),
        backend,
        Arc::new(Orchestrator::from_config(&config)),
    ));

    let app = Router::new().merge(routes::routes()).with_state(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;

    info!("HTTP server listening on {}", addr);
    info!("Ready to accept jobs");

    axum::serve(listener, app).await?;
    Ok(())
}
