use std::sync::Arc;

use axum::{extract::Extension, response::IntoResponse, Json};
use serde_json::json;

use crate::app::errors::reader_error_to_response;
use crate::app::services::{self, AppServices};

pub async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

/// GET /stats: job counts per state plus this process's worker counters.
pub async fn stats(Extension(services): Extension<Arc<AppServices>>) -> axum::response::Response {
    match services.reader.stats().await {
        Ok(jobs) => Json(json!({
            "jobs": jobs,
            "total": jobs.total(),
            "workers": services.worker_stats(),
        }))
        .into_response(),
        Err(e) => reader_error_to_response(e),
    }
}

pub async fn stream(
    Extension(services): Extension<Arc<AppServices>>,
) -> axum::response::Sse<impl tokio_stream::Stream<Item = Result<axum::response::sse::Event, std::convert::Infallible>>> {
    services::job_sse_stream(services)
}
