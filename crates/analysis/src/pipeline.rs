use std::time::Instant;

use async_trait::async_trait;
use chrono::Utc;
use docflow_core::AnalysisResult;
use tracing::{debug, instrument};

use crate::analyzer::{AnalysisRequest, Analyzer};
use crate::documents::{DocumentError, LocalDocuments};
use crate::error::AnalysisError;
use crate::llm::LlmClient;
use crate::prompt::{MAX_DOCUMENT_CHARS, Prompt};
use crate::report::{Report, ReportWriter};

/// Read document, prompt the model, write the report.
#[derive(Debug, Clone)]
pub struct DocumentAnalyzer<C> {
    documents: LocalDocuments,
    reports: ReportWriter,
    llm: C,
}

impl<C: LlmClient> DocumentAnalyzer<C> {
    pub fn new(documents: LocalDocuments, reports: ReportWriter, llm: C) -> Self {
        Self {
            documents,
            reports,
            llm,
        }
    }
}

fn classify_document_error(err: DocumentError) -> AnalysisError {
    // The gateway checked the document at submission; if it is gone or unreadable
    // now, another attempt will not bring it back.
    AnalysisError::Permanent(err.to_string())
}

#[async_trait]
impl<C: LlmClient> Analyzer for DocumentAnalyzer<C> {
    #[instrument(skip(self, request), fields(job_id = %request.job_id, attempt = request.attempt))]
    async fn analyze(&self, request: &AnalysisRequest) -> Result<AnalysisResult, AnalysisError> {
        let started = Instant::now();

        let document = self
            .documents
            .read_text(&request.file_ref, MAX_DOCUMENT_CHARS)
            .await
            .map_err(classify_document_error)?;
        debug!(chars = document.chars().count(), model = self.llm.name(), "document loaded");

        let prompt = Prompt::financial_analysis(&request.query, &document);
        let analysis_text = self.llm.generate(&prompt).await?;
        let processing_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);

        let report = Report {
            job_id: request.job_id,
            query: &request.query,
            file_ref: request.file_ref.as_str(),
            analysis_text: &analysis_text,
            model: self.llm.name(),
            processing_ms,
            generated_at: Utc::now(),
        };
        let artifact = self
            .reports
            .write(&report)
            .await
            .map_err(|e| AnalysisError::Retryable(format!("failed to write report: {e}")))?;

        Ok(AnalysisResult {
            analysis_text,
            artifact_path: artifact.to_string_lossy().into_owned(),
            processing_ms,
        })
    }
}
