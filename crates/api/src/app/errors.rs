use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use docflow_analysis::DocumentError;
use docflow_core::JobId;
use docflow_infra::jobs::{GatewayError, ReaderError};

pub fn gateway_error_to_response(err: GatewayError) -> axum::response::Response {
    match err {
        GatewayError::Validation(msg) => json_error(StatusCode::BAD_REQUEST, "validation_error", msg),
        GatewayError::NotFound(id) => not_found(id),
        GatewayError::Conflict(msg) => json_error(StatusCode::CONFLICT, "conflict", msg),
        GatewayError::Store(e) => store_error(e),
    }
}

pub fn reader_error_to_response(err: ReaderError) -> axum::response::Response {
    match err {
        ReaderError::NotFound(id) => not_found(id),
        ReaderError::Store(e) => store_error(e),
    }
}

pub fn document_error_to_response(err: DocumentError) -> axum::response::Response {
    match err {
        DocumentError::InvalidRef(_) | DocumentError::NotFound(_) => {
            json_error(StatusCode::BAD_REQUEST, "validation_error", err.to_string())
        }
        DocumentError::Io(e) => {
            tracing::error!(error = %e, "failed to store upload");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "storage_error", "failed to store upload")
        }
    }
}

fn not_found(id: JobId) -> axum::response::Response {
    json_error(StatusCode::NOT_FOUND, "not_found", format!("job {id} not found"))
}

fn store_error(err: impl std::fmt::Display) -> axum::response::Response {
    tracing::error!(error = %err, "job store error");
    json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", err.to_string())
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

pub fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, "invalid_id", "job id must be a UUID"))
}
