// Route definitions for the Sandrun API

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::{handlers, AppState};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/execute", post(handlers::submit_job))
        .route("/run", post(handlers::run_sync))
        .route("/job-status", get(handlers::missing_job_id))
        .route("/job-status/", get(handlers::missing_job_id))
        .route("/job-status/:job_id", get(handlers::job_status))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics_handler))
}
