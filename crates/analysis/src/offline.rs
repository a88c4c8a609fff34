//! Deterministic, network-free analysis for development and tests.

use async_trait::async_trait;

use crate::error::AnalysisError;
use crate::llm::LlmClient;
use crate::prompt::Prompt;

const LEADING_LINES: usize = 5;

#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineDigest;

impl OfflineDigest {
    pub fn new() -> Self {
        Self
    }

    pub fn digest(query: &str, document: &str) -> String {
        let lines = document.lines().count();
        let words = document.split_whitespace().count();
        let chars = document.chars().count();
        let numbers = document
            .split_whitespace()
            .filter(|w| w.trim_matches(|c: char| !c.is_ascii_digit()).parse::<f64>().is_ok())
            .count();

        let mut out = format!(
            "Offline digest\n\nQuery: {query}\n\nDocument statistics:\n- lines: {lines}\n- words: {words}\n- characters: {chars}\n- numeric tokens: {numbers}\n\nLeading lines:\n"
        );
        for line in document
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .take(LEADING_LINES)
        {
            out.push_str("> ");
            out.push_str(line);
            out.push('\n');
        }
        out
    }
}

#[async_trait]
impl LlmClient for OfflineDigest {
    fn name(&self) -> &str {
        "offline"
    }

    async fn generate(&self, prompt: &Prompt) -> Result<String, AnalysisError> {
        Ok(Self::digest(&prompt.query, &prompt.document))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic_and_counts() {
        let doc = "Revenue 120\n\nNet income 30\nOutlook stable";
        let a = OfflineDigest::digest("Summarize", doc);
        let b = OfflineDigest::digest("Summarize", doc);
        assert_eq!(a, b);
        assert!(a.contains("Query: Summarize"));
        assert!(a.contains("- lines: 4"));
        assert!(a.contains("- words: 7"));
        assert!(a.contains("- numeric tokens: 2"));
        assert!(a.contains("> Net income 30"));
    }

    #[tokio::test]
    async fn generate_uses_prompt_inputs() {
        let prompt = Prompt::financial_analysis("Risks?", "Debt rising");
        let text = OfflineDigest::new().generate(&prompt).await.unwrap();
        assert!(text.contains("Query: Risks?"));
        assert!(text.contains("> Debt rising"));
    }
}
