use std::sync::Arc;

use axum::{
    extract::{Extension, Path, Query},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde_json::json;

use docflow_core::JobState;
use docflow_infra::jobs::{GatewayError, JobResultView, Submitted};

use crate::app::dto::{ListJobsQuery, SubmitJobRequest};
use crate::app::errors::{gateway_error_to_response, json_error, parse_job_id, reader_error_to_response};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit).get(list))
        .route("/:id", get(get_job))
        .route("/:id/status", get(status))
        .route("/:id/result", get(result))
        .route("/:id/cancel", post(cancel))
        .route("/:id/retry", post(retry))
}

/// `202 {job_id, existed}` for accepted submissions; shared by the upload routes.
pub fn submitted_response(outcome: Result<Submitted, GatewayError>) -> axum::response::Response {
    match outcome {
        Ok(submitted) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "job_id": submitted.job_id,
                "existed": submitted.existed,
            })),
        )
            .into_response(),
        Err(e) => gateway_error_to_response(e),
    }
}

async fn submit(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<SubmitJobRequest>,
) -> axum::response::Response {
    submitted_response(services.gateway.submit(body.into_submission()).await)
}

async fn list(
    Extension(services): Extension<Arc<AppServices>>,
    Query(query): Query<ListJobsQuery>,
) -> axum::response::Response {
    let state = match query.state.as_deref().map(str::parse::<JobState>).transpose() {
        Ok(state) => state,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, "invalid_state", e.to_string()),
    };

    match services.reader.list(state).await {
        Ok(jobs) => Json(jobs).into_response(),
        Err(e) => reader_error_to_response(e),
    }
}

async fn get_job(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.reader.job(id).await {
        Ok(job) => Json(job).into_response(),
        Err(e) => reader_error_to_response(e),
    }
}

async fn status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.reader.status(id).await {
        Ok(view) => Json(view).into_response(),
        Err(e) => reader_error_to_response(e),
    }
}

/// GET /jobs/:id/result
///
/// - 200 with the result once `completed`
/// - 202 with the current state while the job is still pending or running
/// - 422 with the recorded error once `failed`
async fn result(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.reader.result(id).await {
        Ok(JobResultView::Ready(result)) => Json(json!({
            "job_id": id,
            "state": JobState::Completed,
            "result": result,
        }))
        .into_response(),
        Ok(JobResultView::NotReady(state)) => (
            StatusCode::ACCEPTED,
            Json(json!({ "job_id": id, "state": state })),
        )
            .into_response(),
        Ok(JobResultView::Failed(error)) => (
            StatusCode::UNPROCESSABLE_ENTITY,
            Json(json!({
                "job_id": id,
                "state": JobState::Failed,
                "error": error,
            })),
        )
            .into_response(),
        Err(e) => reader_error_to_response(e),
    }
}

async fn cancel(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.gateway.cancel(id).await {
        Ok(job) => Json(job.summary()).into_response(),
        Err(e) => gateway_error_to_response(e),
    }
}

async fn retry(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> axum::response::Response {
    let id = match parse_job_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.gateway.retry(id).await {
        Ok(job) => (StatusCode::ACCEPTED, Json(job.summary())).into_response(),
        Err(e) => gateway_error_to_response(e),
    }
}
