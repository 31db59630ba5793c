use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use common::executor::exe::protocol::{ExeTaskStatus, StartExeRequest, StartExeResponse};

use crate::state::AppState;

/// Error body returned by the proxy
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            message: message.into(),
        }
    }

    fn not_found(task_id: &str) -> Self {
        Self::new("not_found", format!("Task {} not found", task_id))
    }
}

impl IntoResponse for ErrorResponse {
    fn into_response(self) -> Response {
        let status = match self.error.as_str() {
            "not_found" => StatusCode::NOT_FOUND,
            "validation_error" => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(self)).into_response()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelResponse {
    pub task_id: String,
    pub cancelled: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub tasks: usize,
}

/// Start an executable and return its task id
#[tracing::instrument(skip(state, request), fields(exe_path = %request.exe_path))]
pub async fn start_exe(
    State(state): State<AppState>,
    Json(request): Json<StartExeRequest>,
) -> Result<(StatusCode, Json<StartExeResponse>), ErrorResponse> {
    if request.exe_path.trim().is_empty() {
        return Err(ErrorResponse::new(
            "validation_error",
            "exePath must not be empty",
        ));
    }
    let task_id = state.tasks.start(request);
    Ok((StatusCode::CREATED, Json(StartExeResponse { task_id })))
}

/// Status and full output so far of one task
#[tracing::instrument(skip(state))]
pub async fn get_exe(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<ExeTaskStatus>, ErrorResponse> {
    state
        .tasks
        .status(&task_id)
        .map(Json)
        .ok_or_else(|| ErrorResponse::not_found(&task_id))
}

#[tracing::instrument(skip(state))]
pub async fn cancel_exe(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> Result<Json<CancelResponse>, ErrorResponse> {
    if !state.tasks.cancel(&task_id) {
        return Err(ErrorResponse::not_found(&task_id));
    }
    Ok(Json(CancelResponse {
        task_id,
        cancelled: true,
    }))
}

/// Health check endpoint
#[tracing::instrument(skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        tasks: state.tasks.len(),
    })
}
