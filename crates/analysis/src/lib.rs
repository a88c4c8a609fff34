//! Boundary to the document analysis pipeline.
//!
//! The job lifecycle treats analysis as one opaque, re-invocable call
//! (`Analyzer::analyze`). Everything behind it lives here: resolving the input
//! document, building the prompt, calling a model and writing the report.
//! Failures are classified retryable or permanent; nothing else leaks out.

pub mod analyzer;
pub mod documents;
pub mod error;
pub mod gemini;
pub mod llm;
pub mod offline;
pub mod pipeline;
pub mod prompt;
pub mod report;

pub use analyzer::{AnalysisRequest, Analyzer};
pub use documents::{DocumentError, LocalDocuments};
pub use error::AnalysisError;
pub use gemini::{GeminiClient, GeminiConfig};
pub use llm::LlmClient;
pub use offline::OfflineDigest;
pub use pipeline::DocumentAnalyzer;
pub use prompt::Prompt;
pub use report::{Report, ReportWriter};
