//! Text report artifacts.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use docflow_core::JobId;

/// Content of one analysis report.
#[derive(Debug, Clone)]
pub struct Report<'a> {
    pub job_id: JobId,
    pub query: &'a str,
    pub file_ref: &'a str,
    pub analysis_text: &'a str,
    pub model: &'a str,
    pub processing_ms: u64,
    pub generated_at: DateTime<Utc>,
}

impl Report<'_> {
    pub fn render(&self) -> String {
        format!(
            "Financial Document Analysis Report\n\
             ==================================\n\
             \n\
             Analysis ID: {}\n\
             Query: {}\n\
             Document: {}\n\
             Model: {}\n\
             Generated: {}\n\
             \n\
             Processing Time: {:.2} seconds\n\
             \n\
             Analysis Result:\n\
             {}\n",
            self.job_id,
            self.query,
            self.file_ref,
            self.model,
            self.generated_at.to_rfc3339(),
            self.processing_ms as f64 / 1000.0,
            self.analysis_text,
        )
    }
}

/// Writes reports as `analysis_<job id>.txt` under the output directory.
///
/// The name depends only on the job, so a later attempt replaces the report of
/// an earlier one.
#[derive(Debug, Clone)]
pub struct ReportWriter {
    output_dir: PathBuf,
}

impl ReportWriter {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn path_for(&self, job_id: JobId) -> PathBuf {
        self.output_dir.join(format!("analysis_{job_id}.txt"))
    }

    /// Write through a temporary file and rename, so readers never see a partial report.
    pub async fn write(&self, report: &Report<'_>) -> std::io::Result<PathBuf> {
        tokio::fs::create_dir_all(&self.output_dir).await?;
        let path = self.path_for(report.job_id);
        let tmp = path.with_extension("txt.tmp");
        tokio::fs::write(&tmp, report.render()).await?;
        tokio::fs::rename(&tmp, &path).await?;
        Ok(path)
    }
}
