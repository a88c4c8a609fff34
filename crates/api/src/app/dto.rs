use serde::Deserialize;

use docflow_infra::jobs::Submission;

/// Shared default when an upload arrives without a query.
pub const DEFAULT_QUERY: &str = "Analyze this financial document for investment insights";

#[derive(Debug, Deserialize)]
pub struct SubmitJobRequest {
    #[serde(default)]
    pub query: String,
    #[serde(default)]
    pub file_ref: String,
    pub idempotency_key: Option<String>,
}

impl SubmitJobRequest {
    pub fn into_submission(self) -> Submission {
        submission(self.query, self.file_ref, self.idempotency_key)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct AnalyzeDefaultRequest {
    pub query: Option<String>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ListJobsQuery {
    pub state: Option<String>,
}

pub fn submission(query: String, file_ref: String, idempotency_key: Option<String>) -> Submission {
    let submission = Submission::new(query, file_ref);
    match idempotency_key {
        Some(key) => submission.with_idempotency_key(key),
        None => submission,
    }
}
