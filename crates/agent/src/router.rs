//! Chooses between the query pipeline and a direct conversational answer.

use serde::Deserialize;
use tracing::info;

use crate::error::AgentError;
use crate::llm::LlmClient;
use crate::prompts;
use crate::types::{QueryCategory, RoutingDecision, clamp_confidence};

#[derive(Debug, Deserialize)]
struct RouterReply {
    should_use_sql_agent: bool,
    reasoning: String,
    confidence_score: f64,
    query_type: QueryCategory,
}

pub struct Router {
    llm: LlmClient,
}

impl Router {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }

    /// Classify `message`. Provider and parse failures propagate.
    pub async fn route(&self, message: &str) -> Result<RoutingDecision, AgentError> {
        let reply: RouterReply = self.llm.complete_json(prompts::routing(message)).await?;
        let decision = RoutingDecision {
            use_structured_pipeline: reply.should_use_sql_agent,
            rationale: reply.reasoning,
            confidence: clamp_confidence(reply.confidence_score),
            category: reply.query_type,
        };
        info!(
            structured = decision.use_structured_pipeline,
            confidence = decision.confidence,
            category = ?decision.category,
            "Routing decision"
        );
        Ok(decision)
    }
}
