use std::sync::Arc;

use async_trait::async_trait;

use crate::error::AnalysisError;
use crate::prompt::Prompt;

/// Text generation backend used by [`crate::DocumentAnalyzer`].
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Short name for logs and reports.
    fn name(&self) -> &str;

    async fn generate(&self, prompt: &Prompt) -> Result<String, AnalysisError>;
}

#[async_trait]
impl<C> LlmClient for Arc<C>
where
    C: LlmClient + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String, AnalysisError> {
        (**self).generate(prompt).await
    }
}
