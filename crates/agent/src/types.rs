//! Values passed between pipeline stages.

use quarry_core::storage::Row;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Clamp a model-reported confidence into `[0, 1]`. NaN becomes 0.
pub fn clamp_confidence(value: f64) -> f64 {
    if value.is_nan() { 0.0 } else { value.clamp(0.0, 1.0) }
}

/// An inbound request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub user_message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Request {
    pub fn new(user_message: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            session_id: None,
        }
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }
}

/// What kind of request the router saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryCategory {
    Campaign,
    General,
    #[serde(alias = "sql")]
    SqlDirect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingDecision {
    pub use_structured_pipeline: bool,
    pub rationale: String,
    pub confidence: f64,
    pub category: QueryCategory,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidateQuery {
    pub statement: String,
    pub explanation: String,
    pub confidence: f64,
    pub referenced_entities: BTreeSet<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub confidence: f64,
    pub details: String,
    #[serde(default)]
    pub rows: Vec<Row>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub low_confidence_rationale: Option<String>,
    #[serde(default)]
    pub improvement_suggestions: Vec<String>,
    #[serde(default)]
    pub security_violation: bool,
}

impl ValidationOutcome {
    /// Outcome for a statement the guard refused.
    pub fn violation(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            details: message.clone(),
            error: Some(message),
            security_violation: true,
            ..Self::default()
        }
    }

    /// Outcome for a statement the executor could not run.
    pub fn execution_failed(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            details: format!("Query execution failed: {message}"),
            error: Some(message),
            ..Self::default()
        }
    }

    /// Valid and at or above `threshold`.
    pub fn meets(&self, threshold: f64) -> bool {
        self.valid && self.confidence >= threshold
    }

    /// Executed successfully, whatever the judgment said.
    pub fn executed(&self) -> bool {
        self.error.is_none() && !self.security_violation
    }
}

/// Feedback carried from one iteration into the next generation.
#[derive(Debug, Clone, Default)]
pub struct Feedback {
    pub low_confidence_rationale: Option<String>,
    pub improvement_suggestions: Vec<String>,
    pub execution_error: Option<String>,
}

impl Feedback {
    pub fn from_outcome(outcome: &ValidationOutcome) -> Self {
        Self {
            low_confidence_rationale: outcome.low_confidence_rationale.clone(),
            improvement_suggestions: outcome.improvement_suggestions.clone(),
            execution_error: outcome.error.clone(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.low_confidence_rationale.is_none()
            && self.improvement_suggestions.is_empty()
            && self.execution_error.is_none()
    }
}

/// The outcome of one `process()` call.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProcessingResult {
    pub success: bool,
    pub statement: Option<String>,
    pub explanation: Option<String>,
    pub outcome: Option<ValidationOutcome>,
    pub error: Option<String>,
    pub steps: Vec<String>,
    /// Streamed analyst summary or direct answer.
    pub summary: Option<String>,
    /// Generate/validate iterations performed.
    pub attempts: usize,
}

impl ProcessingResult {
    pub fn failed(error: impl Into<String>, steps: Vec<String>, attempts: usize) -> Self {
        Self {
            error: Some(error.into()),
            steps,
            attempts,
            ..Self::default()
        }
    }

    /// Text persisted as the assistant side of the chat transcript.
    pub fn transcript(&self) -> String {
        let mut out = String::new();
        if let Some(statement) = &self.statement {
            out.push_str(&format!("```sql\n{statement}\n```\n\n"));
        }
        if let Some(text) = self.summary.as_ref().or(self.explanation.as_ref()) {
            out.push_str(text);
        } else if let Some(error) = &self.error {
            out.push_str(error);
        }
        out
    }
}

/// How the resolver produced the message it returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    Unchanged,
    LightRewrite,
    ContextRewrite,
}

/// Whether a message depends on earlier conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DependencyAnalysis {
    pub needs_context: bool,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub reasoning: String,
}

#[derive(Debug, Clone)]
pub struct Resolution {
    pub message: String,
    pub strategy: ResolutionStrategy,
    pub analysis: Option<DependencyAnalysis>,
}
