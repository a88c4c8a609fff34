/// Upper bound on document characters sent to a model.
pub const MAX_DOCUMENT_CHARS: usize = 50_000;

/// A model prompt together with the inputs it was built from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub query: String,
    pub document: String,
    pub text: String,
}

impl Prompt {
    /// Single-call financial analyst prompt around the user's query.
    pub fn financial_analysis(query: &str, document: &str) -> Self {
        let text = format!(
            "You are a financial analyst. Analyze the following financial document and provide a comprehensive response.\n\
             \n\
             USER QUERY: {query}\n\
             \n\
             FINANCIAL DOCUMENT:\n\
             {document}\n\
             \n\
             Please provide a complete analysis including:\n\
             1. Direct answer to the user's query\n\
             2. Key financial highlights and metrics\n\
             3. Investment insights and recommendations\n\
             4. Risk assessment and concerns\n\
             5. Overall financial health summary\n\
             \n\
             Format your response as a structured financial analysis report."
        );
        Self {
            query: query.to_string(),
            document: document.to_string(),
            text,
        }
    }
}
