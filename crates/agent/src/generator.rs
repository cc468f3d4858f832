//! Candidate query generation.

use serde::Deserialize;
use tracing::debug;

use crate::error::AgentError;
use crate::history::ValidationHistoryEntry;
use crate::llm::LlmClient;
use crate::prompts;
use crate::types::{CandidateQuery, Feedback, RoutingDecision, clamp_confidence};

fn default_explanation() -> String {
    "No explanation provided".to_string()
}

#[derive(Debug, Deserialize)]
struct GeneratorReply {
    sql_query: String,
    #[serde(default = "default_explanation")]
    explanation: String,
    #[serde(default)]
    confidence_score: f64,
    #[serde(default)]
    tables_used: Vec<String>,
}

pub struct QueryGenerator {
    llm: LlmClient,
    schema: String,
}

impl QueryGenerator {
    pub fn new(llm: LlmClient, schema: impl Into<String>) -> Self {
        Self {
            llm,
            schema: schema.into(),
        }
    }

    pub async fn generate(
        &self,
        message: &str,
        decision: &RoutingDecision,
        feedback: &Feedback,
        recent: &[ValidationHistoryEntry],
    ) -> Result<CandidateQuery, AgentError> {
        let prompt = prompts::generation(&self.schema, message, decision, feedback, recent);
        let reply: GeneratorReply = self.llm.complete_json(prompt).await?;

        let statement = reply.sql_query.trim();
        if statement.is_empty() {
            return Err(AgentError::MalformedOutput("empty sql_query".into()));
        }

        debug!(confidence = reply.confidence_score, "Candidate generated");
        Ok(CandidateQuery {
            statement: statement.to_string(),
            explanation: reply.explanation,
            confidence: clamp_confidence(reply.confidence_score),
            referenced_entities: reply.tables_used.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::ScriptedProvider;
    use crate::types::{QueryCategory, ValidationOutcome};
    use std::sync::Arc;
    use std::time::Duration;

    fn decision() -> RoutingDecision {
        RoutingDecision {
            use_structured_pipeline: true,
            rationale: "needs data".into(),
            confidence: 0.9,
            category: QueryCategory::SqlDirect,
        }
    }

    fn generator(provider: ScriptedProvider) -> (QueryGenerator, Arc<ScriptedProvider>) {
        let provider = Arc::new(provider);
        let llm = LlmClient::new(provider.clone(), "m", Duration::from_secs(5));
        (QueryGenerator::new(llm, prompts::DEFAULT_SCHEMA), provider)
    }

    #[tokio::test]
    async fn optional_fields_take_defaults() {
        let (generator, _) = generator(
            ScriptedProvider::new().on(prompts::GENERATOR_ROLE, "```json\n{\"sql_query\": \"SELECT email FROM customers\"}\n```"),
        );
        let candidate = generator
            .generate("emails", &decision(), &Feedback::default(), &[])
            .await
            .unwrap();
        assert_eq!(candidate.statement, "SELECT email FROM customers");
        assert_eq!(candidate.explanation, "No explanation provided");
        assert_eq!(candidate.confidence, 0.0);
        assert!(candidate.referenced_entities.is_empty());
    }

    #[tokio::test]
    async fn entities_are_deduplicated() {
        let (generator, _) = generator(ScriptedProvider::new().on(
            prompts::GENERATOR_ROLE,
            r#"{"sql_query": "SELECT 1", "explanation": "x", "confidence_score": 0.8, "tables_used": ["customers", "customers"]}"#,
        ));
        let candidate = generator
            .generate("x", &decision(), &Feedback::default(), &[])
            .await
            .unwrap();
        assert_eq!(candidate.referenced_entities.len(), 1);
    }

    #[tokio::test]
    async fn missing_statement_is_malformed() {
        let (generator, _) = generator(ScriptedProvider::new().on(prompts::GENERATOR_ROLE, r#"{"sql_query": "  "}"#));
        let err = generator
            .generate("x", &decision(), &Feedback::default(), &[])
            .await
            .unwrap_err();
        assert!(matches!(err, AgentError::MalformedOutput(_)));
    }

    #[tokio::test]
    async fn feedback_and_history_reach_the_prompt() {
        let (generator, provider) = generator(ScriptedProvider::new().on(prompts::GENERATOR_ROLE, r#"{"sql_query": "SELECT 1"}"#));
        let failed = ValidationOutcome::execution_failed("no such column: emial");
        let recent = vec![ValidationHistoryEntry::new("x", "SELECT emial FROM customers", &failed)];
        let feedback = Feedback::from_outcome(&failed);

        generator.generate("x", &decision(), &feedback, &recent).await.unwrap();

        let user = &provider.requests()[0].messages[1].content;
        assert!(user.contains("RECENT VALIDATION RESULTS"));
        assert!(user.contains("SELECT emial FROM customers"));
        assert!(user.contains("SQL EXECUTION ERROR (CRITICAL): no such column: emial"));
    }
}
