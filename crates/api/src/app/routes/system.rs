use std::sync::Arc;

use axum::{extract::Extension, http::StatusCode, response::IntoResponse, Json};
use chrono::Utc;

use crate::app::errors;
use crate::app::services::AppServices;

pub async fn health() -> StatusCode {
    StatusCode::OK
}

pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    let svc = services.clone();
    let runs = match tokio::task::spawn_blocking(move || svc.retrier.stats()).await {
        Ok(Ok(stats)) => stats,
        Ok(Err(e)) => return errors::retrier_error_to_response(e),
        Err(e) => {
            return errors::json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                e.to_string(),
            )
        }
    };

    let uptime = Utc::now() - services.started_at;
    (
        StatusCode::OK,
        Json(serde_json::json!({
            "runs": runs,
            "pending_jobs": services.scheduler.pending_count(),
            "worker": services.worker.snapshot(),
            "store": services.store_kind,
            "uptime_seconds": uptime.num_seconds().max(0),
        })),
    )
        .into_response()
}
