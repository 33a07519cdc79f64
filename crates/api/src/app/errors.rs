use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use retrier_infra::runs::{RetrierError, RunStoreError};
use retrier_infra::scheduler::SchedulerError;

pub fn retrier_error_to_response(err: RetrierError) -> axum::response::Response {
    match err {
        RetrierError::NotFound(id) => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("run {id} not found"))
        }
        RetrierError::NotCompleted(id) => json_error(
            StatusCode::CONFLICT,
            "not_completed",
            format!("run {id} has not completed"),
        ),
        RetrierError::InvalidOptions(e) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string())
        }
        RetrierError::Store(RunStoreError::Conflict { .. }) => {
            json_error(StatusCode::CONFLICT, "conflict", err.to_string())
        }
        RetrierError::Store(_) => {
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string())
        }
        RetrierError::Scheduler(SchedulerError::Unavailable(_)) => json_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "scheduler_unavailable",
            err.to_string(),
        ),
        RetrierError::Scheduler(_) => json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "scheduler_error",
            err.to_string(),
        ),
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
