//! Safety check, execution and relevance judgment for a candidate query.

use quarry_core::storage::QueryExecutor;
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::AgentError;
use crate::guard;
use crate::llm::LlmClient;
use crate::prompts;
use crate::types::{CandidateQuery, ValidationOutcome, clamp_confidence};

#[derive(Debug, Deserialize)]
struct ValidatorReply {
    is_valid: bool,
    confidence_score: f64,
    #[serde(default)]
    validation_details: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    low_confidence_explanation: Option<String>,
    #[serde(default)]
    improvement_suggestions: Option<Vec<String>>,
}

pub struct Validator {
    llm: LlmClient,
    executor: Arc<dyn QueryExecutor>,
    schema: String,
    sample_rows: usize,
}

impl Validator {
    pub fn new(llm: LlmClient, executor: Arc<dyn QueryExecutor>, schema: impl Into<String>, sample_rows: usize) -> Self {
        Self {
            llm,
            executor,
            schema: schema.into(),
            sample_rows,
        }
    }

    /// Validate `candidate` against the request `intent`.
    ///
    /// Guard violations and execution failures come back as outcomes; only
    /// a failed judgment call is an error.
    pub async fn validate(&self, intent: &str, candidate: &CandidateQuery) -> Result<ValidationOutcome, AgentError> {
        if let Some(violation) = guard::check(&candidate.statement) {
            warn!(statement = %candidate.statement, "Statement refused by read-only guard");
            return Ok(ValidationOutcome::violation(violation));
        }

        let rows = match self.executor.execute(&candidate.statement).await {
            Ok(rows) => rows,
            Err(e) => {
                debug!(error = %e, "Candidate failed to execute");
                return Ok(ValidationOutcome::execution_failed(e.to_string()));
            }
        };

        let sample = &rows[..rows.len().min(self.sample_rows)];
        let prompt = prompts::validation(&self.schema, intent, candidate, sample, rows.len());
        let reply: ValidatorReply = self.llm.complete_json(prompt).await?;

        Ok(ValidationOutcome {
            valid: reply.is_valid,
            confidence: clamp_confidence(reply.confidence_score),
            details: reply.validation_details,
            rows,
            error: reply.error_message.filter(|e| !e.trim().is_empty()),
            low_confidence_rationale: reply.low_confidence_explanation.filter(|e| !e.trim().is_empty()),
            improvement_suggestions: reply.improvement_suggestions.unwrap_or_default(),
            security_violation: false,
        })
    }
}
