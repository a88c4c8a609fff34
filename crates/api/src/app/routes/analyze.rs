//! Submission shortcuts: upload a document, or analyze the configured default one.

use std::sync::Arc;

use axum::{
    extract::{multipart::Field, Extension, Multipart},
    http::StatusCode,
    Json,
};

use docflow_infra::jobs::Submitted;

use crate::app::dto::{submission, AnalyzeDefaultRequest, DEFAULT_QUERY};
use crate::app::errors::{document_error_to_response, json_error};
use crate::app::routes::jobs::submitted_response;
use crate::app::services::AppServices;

struct Upload {
    file_name: Option<String>,
    bytes: Vec<u8>,
}

/// POST /analyze (multipart: `file`, optional `query`, optional `idempotency_key`).
pub async fn upload(
    Extension(services): Extension<Arc<AppServices>>,
    mut multipart: Multipart,
) -> axum::response::Response {
    let mut upload = None;
    let mut query = None;
    let mut idempotency_key = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => return json_error(StatusCode::BAD_REQUEST, "invalid_multipart", e.body_text()),
        };
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => {
                let file_name = field.file_name().map(str::to_string);
                match field.bytes().await {
                    Ok(bytes) => {
                        upload = Some(Upload {
                            file_name,
                            bytes: bytes.to_vec(),
                        })
                    }
                    Err(e) => return json_error(StatusCode::BAD_REQUEST, "invalid_multipart", e.body_text()),
                }
            }
            "query" => match text(field).await {
                Ok(value) => query = Some(value),
                Err(resp) => return resp,
            },
            "idempotency_key" => match text(field).await {
                Ok(value) => idempotency_key = Some(value).filter(|k| !k.trim().is_empty()),
                Err(resp) => return resp,
            },
            _ => {}
        }
    }

    let Some(upload) = upload else {
        return json_error(StatusCode::BAD_REQUEST, "validation_error", "multipart field 'file' is required");
    };
    if upload.bytes.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "validation_error", "uploaded file is empty");
    }

    let file_ref = match services
        .gateway
        .documents()
        .save_upload(upload.file_name.as_deref(), &upload.bytes)
        .await
    {
        Ok(file_ref) => file_ref,
        Err(e) => return document_error_to_response(e),
    };
    tracing::info!(file_ref = %file_ref, size = upload.bytes.len(), "stored upload");

    let submitted = services
        .gateway
        .submit(submission(query_or_default(query), file_ref.to_string(), idempotency_key))
        .await;
    if !matches!(submitted, Ok(Submitted { existed: false, .. })) {
        // No new job references the file.
        if let Err(e) = services.gateway.documents().remove(&file_ref).await {
            tracing::warn!(file_ref = %file_ref, error = %e, "failed to remove unused upload");
        }
    }
    submitted_response(submitted)
}

/// POST /analyze-default (optional JSON `{query, idempotency_key}`).
pub async fn default_document(
    Extension(services): Extension<Arc<AppServices>>,
    body: Option<Json<AnalyzeDefaultRequest>>,
) -> axum::response::Response {
    let body = body.map(|Json(body)| body).unwrap_or_default();
    let query = query_or_default(body.query);
    let file_ref = services.default_document().to_string();
    submitted_response(
        services
            .gateway
            .submit(submission(query, file_ref, body.idempotency_key))
            .await,
    )
}

/// A missing or blank query falls back to the default analysis question.
fn query_or_default(query: Option<String>) -> String {
    query
        .filter(|q| !q.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_QUERY.to_string())
}

async fn text(field: Field<'_>) -> Result<String, axum::response::Response> {
    field
        .text()
        .await
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, "invalid_multipart", e.body_text()))
}
