//! Status HTTP server
//!
//! Exposes the queue over HTTP for scripts and dashboards. All handlers are
//! thin wrappers over [`QueueManager`].

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use thiserror::Error;
use tracing::info;

use crate::job::{Job, JobError, JobSpec};
use crate::queue::{QueueError, QueueManager, QueueSnapshot};

/// Errors that can occur when running the status server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("invalid listen address {0:?}")]
    InvalidAddr(String),

    #[error("failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Body of `POST /jobs`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddJobRequest {
    #[serde(flatten)]
    pub spec: JobSpec,
    #[serde(default)]
    pub priority: i32,
}

/// Body of `PUT /queue/config`. Absent fields are left unchanged.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfigRequest {
    pub max_parallel_jobs: Option<u32>,
    pub auto_start: Option<bool>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

struct ApiError(StatusCode, String);

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        let status = match &err {
            QueueError::NotFound(_) => StatusCode::NOT_FOUND,
            QueueError::InputMissing(_) | QueueError::Job(JobError::InvalidSpec(_)) => {
                StatusCode::BAD_REQUEST
            }
            QueueError::Job(JobError::InvalidTransition { .. }) | QueueError::Finalizing(_) => {
                StatusCode::CONFLICT
            }
            QueueError::Store(_) | QueueError::Log { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        };
        ApiError(status, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.0, Json(ErrorBody { error: self.1 })).into_response()
    }
}

fn not_found(id: &str) -> ApiError {
    ApiError(StatusCode::NOT_FOUND, format!("job not found: {}", id))
}

async fn get_queue(State(queue): State<QueueManager>) -> Json<QueueSnapshot> {
    Json(queue.snapshot())
}

async fn get_job(
    State(queue): State<QueueManager>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    queue.job(&id).map(Json).ok_or_else(|| not_found(&id))
}

async fn get_job_log(
    State(queue): State<QueueManager>,
    Path(id): Path<String>,
) -> Result<String, ApiError> {
    Ok(queue.job_log(&id)?)
}

async fn add_job(
    State(queue): State<QueueManager>,
    Json(req): Json<AddJobRequest>,
) -> Result<(StatusCode, Json<Job>), ApiError> {
    let job = queue.add_job(req.spec, req.priority)?;
    Ok((StatusCode::CREATED, Json(job)))
}

async fn remove_job(
    State(queue): State<QueueManager>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    queue.remove_job(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn cancel_job(
    State(queue): State<QueueManager>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    queue.cancel_job(&id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn start_queue(State(queue): State<QueueManager>) -> Json<QueueSnapshot> {
    queue.start_processing();
    Json(queue.snapshot())
}

async fn pause_queue(State(queue): State<QueueManager>) -> Json<QueueSnapshot> {
    queue.pause_processing();
    Json(queue.snapshot())
}

async fn update_config(
    State(queue): State<QueueManager>,
    Json(req): Json<QueueConfigRequest>,
) -> Json<QueueSnapshot> {
    if let Some(max) = req.max_parallel_jobs {
        queue.set_max_parallel_jobs(max);
    }
    if let Some(auto_start) = req.auto_start {
        queue.set_auto_start(auto_start);
    }
    Json(queue.snapshot())
}

/// Creates the axum Router with the queue endpoints
pub fn create_router(queue: QueueManager) -> Router {
    Router::new()
        .route("/queue", get(get_queue))
        .route("/queue/start", post(start_queue))
        .route("/queue/pause", post(pause_queue))
        .route("/queue/config", put(update_config))
        .route("/jobs", post(add_job))
        .route("/jobs/:id", get(get_job).delete(remove_job))
        .route("/jobs/:id/log", get(get_job_log))
        .route("/jobs/:id/cancel", post(cancel_job))
        .with_state(queue)
}

/// Runs the status server until the task is dropped or the listener fails.
pub async fn run_status_server(queue: QueueManager, addr: &str) -> Result<(), ServerError> {
    let addr: SocketAddr = addr
        .parse()
        .map_err(|_| ServerError::InvalidAddr(addr.to_string()))?;
    let app = create_router(queue);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "status server listening");
    axum::serve(listener, app).await?;

    Ok(())
}
