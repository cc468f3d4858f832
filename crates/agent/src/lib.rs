//! The Quarry request pipeline.
//!
//! Every request passes through the same stages:
//!
//! 1. **Resolve** the message against earlier conversation ([`ContextResolver`])
//! 2. **Route** it to the query pipeline or a direct answer ([`Router`])
//! 3. **Generate ⇄ validate** a read-only query until it is accepted, a
//!    safety violation ends the run, or the iteration bound is hit
//!    ([`QueryGenerator`], [`Validator`])
//! 4. **Enrich** accepted results: a streamed summary ([`Analyst`]), the
//!    rows, and per-recipient channel messages ([`Personalizer`])
//!
//! [`Orchestrator`] drives the stages and publishes progress to an
//! `EventBus`; [`ChatService`] runs it as a background task per request.

pub mod analyst;
pub mod error;
pub mod extract;
pub mod generator;
pub mod guard;
pub mod history;
pub mod llm;
pub mod orchestrator;
pub mod personalizer;
pub mod prompts;
pub mod resolver;
pub mod router;
pub mod service;
pub mod types;
pub mod validator;

#[cfg(test)]
pub(crate) mod test_helpers;

pub use analyst::Analyst;
pub use error::AgentError;
pub use extract::{ExtractError, extract_json, parse_json};
pub use generator::QueryGenerator;
pub use history::{ValidationHistory, ValidationHistoryEntry};
pub use llm::{LlmClient, Prompt};
pub use orchestrator::Orchestrator;
pub use personalizer::{Channel, ChannelMessages, ChannelTemplate, Personalizer};
pub use resolver::ContextResolver;
pub use router::Router;
pub use service::{ChatService, ChatStream};
pub use types::{
    CandidateQuery, DependencyAnalysis, Feedback, ProcessingResult, QueryCategory, Request, Resolution,
    ResolutionStrategy, RoutingDecision, ValidationOutcome,
};
pub use validator::Validator;
