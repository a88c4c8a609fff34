//! Gemini `generateContent` client.
//!
//! One call per analysis attempt. Classification:
//! - connection errors, timeouts, 429 and 5xx are retryable
//! - any other 4xx, blocked prompts and empty candidates are permanent

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::AnalysisError;
use crate::llm::LlmClient;
use crate::prompt::Prompt;

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
pub const DEFAULT_MODEL: &str = "gemini-1.5-flash";

#[derive(Clone)]
pub struct GeminiConfig {
    pub api_key: String,
    pub model: String,
    pub base_url: String,
    pub request_timeout: Duration,
}

impl std::fmt::Debug for GeminiConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("base_url", &self.base_url)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

impl GeminiConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            request_timeout: Duration::from_secs(120),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[derive(Debug, Clone)]
pub struct GeminiClient {
    client: Client,
    config: GeminiConfig,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
}

#[derive(Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Result<Self, reqwest::Error> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .pool_max_idle_per_host(5)
            .build()?;
        Ok(Self { client, config })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}:generateContent",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }
}

/// Retry decision for a non-success HTTP status.
fn classify_status(status: StatusCode, body: &str) -> AnalysisError {
    let msg = format!("gemini returned HTTP {status}: {}", truncate(body, 300));
    if status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
        || status.is_server_error()
    {
        AnalysisError::Retryable(msg)
    } else {
        AnalysisError::Permanent(msg)
    }
}

/// The request URL carries the API key, so it is stripped before the error is recorded.
fn classify_transport(err: reqwest::Error) -> AnalysisError {
    let err = err.without_url();
    if err.is_builder() {
        AnalysisError::Permanent(format!("gemini request could not be built: {err}"))
    } else {
        AnalysisError::Retryable(format!("gemini request failed: {err}"))
    }
}

/// Concatenated text of the first candidate.
fn extract_text(response: GenerateResponse) -> Result<String, AnalysisError> {
    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Err(AnalysisError::Permanent(format!("prompt blocked: {reason}")));
    }
    let Some(candidate) = response.candidates.into_iter().next() else {
        return Err(AnalysisError::Permanent("gemini returned no candidates".to_string()));
    };
    let text: String = candidate
        .content
        .map(|c| c.parts.into_iter().filter_map(|p| p.text).collect())
        .unwrap_or_default();
    if text.trim().is_empty() {
        let reason = candidate.finish_reason.unwrap_or_else(|| "unknown".to_string());
        return Err(AnalysisError::Permanent(format!(
            "gemini returned an empty response (finish reason: {reason})"
        )));
    }
    Ok(text)
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[async_trait]
impl LlmClient for GeminiClient {
    fn name(&self) -> &str {
        &self.config.model
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String, AnalysisError> {
        let request = GenerateRequest {
            contents: vec![Content {
                parts: vec![Part { text: &prompt.text }],
            }],
        };

        debug!(model = %self.config.model, prompt_chars = prompt.text.len(), "calling gemini");
        let response = self
            .client
            .post(self.endpoint())
            .query(&[("key", self.config.api_key.as_str())])
            .json(&request)
            .send()
            .await
            .map_err(classify_transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let err = classify_status(status, &body);
            warn!(model = %self.config.model, %status, retryable = err.is_retryable(), "gemini call failed");
            return Err(err);
        }

        // A body cut off mid-stream decodes badly; treat it like a dropped connection.
        let parsed: GenerateResponse = response
            .json()
            .await
            .map_err(|e| AnalysisError::Retryable(format!("failed to decode gemini response: {}", e.without_url())))?;

        extract_text(parsed)
    }
}
