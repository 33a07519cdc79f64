use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use retrier_core::RunId;
use retrier_infra::runs::RetryOptionsPatch;

use crate::app::errors;

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct StartRunRequest {
    /// Registered function name, e.g. `example.my_action`
    pub action: String,
    pub args: Option<JsonValue>,
    /// Unset fields fall back to the configured defaults.
    pub options: Option<RetryOptionsPatch>,
}

#[derive(Debug, Deserialize)]
pub struct KickoffRequest {
    pub action: String,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct StartRunResponse {
    pub run_id: RunId,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    /// `false` when the run had already completed
    pub accepted: bool,
}

pub fn parse_run_id(id: &str) -> Result<RunId, axum::response::Response> {
    id.parse().map_err(|_| {
        errors::json_error(
            axum::http::StatusCode::BAD_REQUEST,
            "invalid_id",
            format!("invalid run id: {id}"),
        )
    })
}
