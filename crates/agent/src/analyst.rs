//! Business summary of an accepted query's results.

use crate::error::AgentError;
use crate::llm::LlmClient;
use crate::prompts;
use crate::types::{CandidateQuery, ValidationOutcome};

pub struct Analyst {
    llm: LlmClient,
    sample_rows: usize,
}

impl Analyst {
    pub fn new(llm: LlmClient, sample_rows: usize) -> Self {
        Self { llm, sample_rows }
    }

    /// Stream the summary through `on_fragment` and return the full text.
    pub async fn summarize<F>(
        &self,
        intent: &str,
        candidate: &CandidateQuery,
        outcome: &ValidationOutcome,
        on_fragment: F,
    ) -> Result<String, AgentError>
    where
        F: FnMut(&str) + Send,
    {
        let sample = &outcome.rows[..outcome.rows.len().min(self.sample_rows)];
        let prompt = prompts::analyst_summary(intent, candidate, outcome, sample);
        Ok(self.llm.stream(prompt, on_fragment).await?)
    }
}
