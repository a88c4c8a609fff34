use axum::{
    routing::{get, post},
    Router,
};

pub mod analyze;
pub mod jobs;
pub mod system;

pub fn router() -> Router {
    Router::new()
        .route("/health", get(system::health))
        .route("/stats", get(system::stats))
        .route("/stream", get(system::stream))
        .route("/analyze", post(analyze::upload))
        .route("/analyze-default", post(analyze::default_document))
        .nest("/jobs", jobs::router())
}
