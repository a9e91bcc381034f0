// HTTP route handlers for the Sandrun API

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use sandrun_common::languages::config_for;
use sandrun_common::store::{code_key, discard_blob, record_status, BlobStore, JobQueue, StatusStore};
use sandrun_common::{JobDescriptor, JobStatus, StatusRecord};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::metrics;
use crate::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct ExecuteRequest {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct JobStatusResponse {
    pub status: JobStatus,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<StatusRecord> for JobStatusResponse {
    fn from(record: StatusRecord) -> Self {
        let data = record.data.unwrap_or_default();
        Self {
            status: record.status,
            timestamp: record.timestamp,
            result: data.result.filter(|_| record.status == JobStatus::Completed),
            error: data.error.filter(|_| record.status == JobStatus::Failed),
        }
    }
}

fn error_body(status: StatusCode, error: &str) -> Response {
    (status, Json(json!({ "error": error }))).into_response()
}

fn failure_body(error: &str, message: impl std::fmt::Display) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": error, "message": message.to_string() })),
    )
        .into_response()
}

fn read_body(
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Result<ExecuteRequest, Response> {
    match payload {
        Ok(Json(request)) => Ok(request),
        Err(JsonRejection::MissingJsonContentType(_)) => {
            Err(error_body(StatusCode::BAD_REQUEST, "Request body is required"))
        }
        Err(rejection) => Err(error_body(
            StatusCode::BAD_REQUEST,
            &format!("Invalid request body: {}", rejection.body_text()),
        )),
    }
}

/// POST /execute - Queue a job for asynchronous execution
pub async fn submit_job(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Response {
    let response = queue_job(&state, payload).await;
    metrics::record_api_request("/execute", "POST", response.status().as_u16());
    response
}

async fn queue_job(
    state: &AppState,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Response {
    let request = match read_body(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let code = request.code.unwrap_or_default();
    let language_id = request.language.unwrap_or_default();

    let language = match state.guard.validate(&code, &language_id) {
        Ok(language) => language,
        Err(e) => {
            metrics::record_job_rejected(e.reason());
            info!(language = %language_id, reason = e.reason(), "Submission rejected");
            return error_body(StatusCode::BAD_REQUEST, &e.to_string());
        }
    };

    let config = config_for(language);
    let job_id = Uuid::new_v4();
    let key = code_key(&job_id, language);

    if let Err(e) = state.blobs.put(&key, code.as_bytes()).await {
        error!(job_id = %job_id, error = %e, "Failed to store source");
        return failure_body("Failed to queue code execution", e);
    }

    if let Err(e) = state
        .status
        .put(job_id, &StatusRecord::queued(language.as_str(), &key))
        .await
    {
        error!(job_id = %job_id, error = %e, "Failed to record queued status");
        discard_blob(&*state.blobs, &key).await;
        return failure_body("Failed to queue code execution", e);
    }

    let descriptor = JobDescriptor {
        job_id,
        language: language.as_str().to_string(),
        code_key: key.clone(),
        timestamp: chrono::Utc::now().timestamp_millis(),
        timeout: Some(config.default_timeout_ms),
        memory_limit: Some(config.memory_limit.to_string()),
    };

    if let Err(e) = state.queue.enqueue(&descriptor).await {
        error!(job_id = %job_id, error = %e, "Failed to enqueue job");
        let record = StatusRecord::failed(
            "Failed to queue code execution".to_string(),
            None,
            language.as_str(),
        );
        record_status(&*state.status, job_id, &record).await;
        discard_blob(&*state.blobs, &key).await;
        return failure_body("Failed to queue code execution", e);
    }

    metrics::record_job_submitted(language.as_str());
    info!(job_id = %job_id, language = %language, code_key = %key, "Job queued");

    (
        StatusCode::OK,
        Json(SubmitResponse {
            job_id,
            status: JobStatus::Queued,
            message: "Code execution job has been queued successfully".to_string(),
        }),
    )
        .into_response()
}

/// GET /job-status/:job_id
pub async fn job_status(State(state): State<Arc<AppState>>, Path(job_id): Path<String>) -> Response {
    let response = lookup_status(&state, &job_id).await;
    metrics::record_api_request("/job-status", "GET", response.status().as_u16());
    response
}

async fn lookup_status(state: &AppState, job_id: &str) -> Response {
    // An id we never issued cannot have a status
    let Ok(job_id) = Uuid::parse_str(job_id) else {
        return error_body(StatusCode::NOT_FOUND, "Job not found");
    };

    match state.status.get(job_id).await {
        Ok(Some(record)) => (StatusCode::OK, Json(JobStatusResponse::from(record))).into_response(),
        Ok(None) => error_body(StatusCode::NOT_FOUND, "Job not found"),
        Err(e) => {
            error!(job_id = %job_id, error = %e, "Failed to read job status");
            failure_body("Failed to get job status", e)
        }
    }
}

/// GET /job-status and /job-status/ - no id supplied
pub async fn missing_job_id() -> Response {
    metrics::record_api_request("/job-status", "GET", StatusCode::BAD_REQUEST.as_u16());
    error_body(StatusCode::BAD_REQUEST, "Job ID is required")
}

/// POST /run - Execute synchronously under the whole-pipeline deadline
pub async fn run_sync(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Response {
    let response = run_inline(&state, payload).await;
    metrics::record_api_request("/run", "POST", response.status().as_u16());
    response
}

async fn run_inline(
    state: &AppState,
    payload: Result<Json<ExecuteRequest>, JsonRejection>,
) -> Response {
    let request = match read_body(payload) {
        Ok(request) => request,
        Err(response) => return response,
    };
    let code = request.code.unwrap_or_default();
    let language_id = request.language.unwrap_or_default();

    let language = match state.guard.validate(&code, &language_id) {
        Ok(language) => language,
        Err(e) => {
            metrics::record_job_rejected(e.reason());
            return error_body(StatusCode::BAD_REQUEST, &e.to_string());
        }
    };

    let run_id = Uuid::new_v4();
    let result = state
        .orchestrator
        .execute_within(&code, language.as_str(), run_id, state.sync_deadline)
        .await;

    let outcome = match result.error_kind {
        None => "success",
        Some(kind) => kind.as_str(),
    };
    metrics::record_sync_run(language.as_str(), outcome, result.duration_ms as f64);

    if !result.success {
        warn!(run_id = %run_id, outcome = outcome, "Synchronous run failed");
    }

    (StatusCode::OK, Json(result)).into_response()
}

/// GET /health
pub async fn health_check(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "uptimeSecs": state.start_time.elapsed().as_secs(),
        })),
    )
}

/// GET /metrics - Prometheus text format
pub async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.queue.depth().await {
        Ok(depth) => metrics::set_queue_depth(depth),
        Err(e) => warn!(error = %e, "Failed to sample queue depth"),
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics::render_metrics(),
    )
}
