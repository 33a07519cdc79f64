use axum::{routing::get, Router};

pub mod runs;
pub mod system;

/// Router for the run endpoints.
pub fn router() -> Router {
    Router::new()
        .route("/stats", get(system::stats))
        .nest("/runs", runs::router())
        .nest("/examples", runs::examples_router())
}
