use std::sync::Arc;

use axum::{
    extract::{Extension, Path},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::Value as JsonValue;

use retrier_infra::runs::RetrierResult;
use retrier_infra::scheduler::FunctionRef;

use crate::actions;
use crate::app::services::{ApiRetrier, AppServices};
use crate::app::{dto, errors};

pub fn router() -> Router {
    Router::new()
        .route("/", post(start_run))
        .route("/:id", get(get_status).delete(cleanup_run))
        .route("/:id/record", get(get_record))
        .route("/:id/cancel", post(cancel_run))
}

pub fn examples_router() -> Router {
    Router::new().route("/my_action", post(kickoff_my_action))
}

/// Run a retrier call on the blocking pool; the store may block on I/O.
async fn with_retrier<T, F>(services: Arc<AppServices>, f: F) -> Result<T, axum::response::Response>
where
    T: Send + 'static,
    F: FnOnce(&ApiRetrier) -> RetrierResult<T> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || f(&services.retrier)).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(errors::retrier_error_to_response(e)),
        Err(e) => Err(errors::json_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            e.to_string(),
        )),
    }
}

pub async fn start_run(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::StartRunRequest>,
) -> axum::response::Response {
    if body.action.trim().is_empty() {
        return errors::json_error(
            StatusCode::BAD_REQUEST,
            "validation_error",
            "action must not be empty",
        );
    }

    let action = FunctionRef::new(body.action);
    let args = body.args.unwrap_or(JsonValue::Null);
    let patch = body.options.unwrap_or_default();

    match with_retrier(services, move |r| r.start_with_defaults(action, args, patch)).await {
        Ok(run_id) => (StatusCode::CREATED, Json(dto::StartRunResponse { run_id })).into_response(),
        Err(resp) => resp,
    }
}

pub async fn get_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let run_id = match dto::parse_run_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match with_retrier(services, move |r| r.status(run_id)).await {
        Ok(status) => (StatusCode::OK, Json(status)).into_response(),
        Err(resp) => resp,
    }
}

pub async fn get_record(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let run_id = match dto::parse_run_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match with_retrier(services, move |r| r.run(run_id)).await {
        Ok(run) => (StatusCode::OK, Json(run)).into_response(),
        Err(resp) => resp,
    }
}

pub async fn cancel_run(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let run_id = match dto::parse_run_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match with_retrier(services, move |r| r.cancel(run_id)).await {
        Ok(accepted) => (StatusCode::OK, Json(dto::CancelResponse { accepted })).into_response(),
        Err(resp) => resp,
    }
}

pub async fn cleanup_run(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let run_id = match dto::parse_run_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match with_retrier(services, move |r| r.cleanup(run_id)).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(resp) => resp,
    }
}

/// Start the demo action with the kickoff options.
pub async fn kickoff_my_action(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::KickoffRequest>,
) -> axum::response::Response {
    let args = serde_json::json!({ "action": body.action });

    let started = with_retrier(services, move |r| {
        r.start(
            FunctionRef::new(actions::MY_ACTION),
            args,
            actions::kickoff_options(),
        )
    })
    .await;

    match started {
        Ok(run_id) => (StatusCode::CREATED, Json(dto::StartRunResponse { run_id })).into_response(),
        Err(resp) => resp,
    }
}
