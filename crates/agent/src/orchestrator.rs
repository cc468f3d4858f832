//! The request pipeline: resolve, route, then either generate/validate in a
//! bounded loop or answer directly, publishing progress to an [`EventBus`].
//!
//! `process()` always ends the stream. A guard closes the bus when the
//! pipeline returns, fails, or unwinds from a panic.

use quarry_config::PipelineConfig;
use quarry_core::event::{EventBus, EventKind, StreamEvent};
use quarry_core::storage::{ChatStore, QueryExecutor};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::analyst::Analyst;
use crate::error::AgentError;
use crate::generator::QueryGenerator;
use crate::history::{ValidationHistory, ValidationHistoryEntry};
use crate::llm::LlmClient;
use crate::personalizer::Personalizer;
use crate::prompts;
use crate::resolver::{ContextResolver, preview};
use crate::router::Router;
use crate::types::{
    CandidateQuery, Feedback, ProcessingResult, Request, ResolutionStrategy, RoutingDecision, ValidationOutcome,
};
use crate::validator::Validator;

/// Closes the bus on drop unless the consumer already went away.
struct StreamGuard<'a>(&'a EventBus);

impl Drop for StreamGuard<'_> {
    fn drop(&mut self) {
        if self.0.is_streaming() {
            self.0.close();
        }
    }
}

/// Publishes events tagged with the request's session id.
struct Emitter<'a> {
    bus: &'a EventBus,
    correlation_id: Option<&'a str>,
}

impl Emitter<'_> {
    fn send(&self, event: StreamEvent) {
        self.bus.publish(event.with_correlation_id(self.correlation_id));
    }

    fn status(&self, content: impl Into<String>) {
        self.send(StreamEvent::status(content));
    }

    fn thinking(&self, content: impl Into<String>) {
        self.send(StreamEvent::thinking(content));
    }

    fn error(&self, content: impl Into<String>) {
        self.send(StreamEvent::error(content));
    }

    fn partial(&self, fragment: &str) {
        self.send(StreamEvent::new(EventKind::PartialAnswer, fragment));
    }

    fn event(&self, kind: EventKind, content: impl Into<String>, payload: Value) {
        self.send(StreamEvent::new(kind, content).with_payload(payload));
    }
}

pub struct Orchestrator {
    llm: LlmClient,
    executor: Arc<dyn QueryExecutor>,
    chat_store: Arc<dyn ChatStore>,
    history: Arc<ValidationHistory>,
    settings: PipelineConfig,
    resolver: ContextResolver,
    router: Router,
    generator: QueryGenerator,
    validator: Validator,
    analyst: Analyst,
    personalizer: Personalizer,
}

impl Orchestrator {
    /// Build a pipeline over the default schema description with its own
    /// validation history.
    pub fn new(
        llm: LlmClient,
        executor: Arc<dyn QueryExecutor>,
        chat_store: Arc<dyn ChatStore>,
        settings: PipelineConfig,
    ) -> Self {
        let schema = prompts::DEFAULT_SCHEMA;
        Self {
            resolver: ContextResolver::new(llm.clone()),
            router: Router::new(llm.clone()),
            generator: QueryGenerator::new(llm.clone(), schema),
            validator: Validator::new(llm.clone(), executor.clone(), schema, settings.sample_rows),
            analyst: Analyst::new(llm.clone(), settings.sample_rows),
            personalizer: Personalizer::new(llm.clone(), settings.sample_rows),
            history: Arc::new(ValidationHistory::new(settings.history_capacity)),
            llm,
            executor,
            chat_store,
            settings,
        }
    }

    /// Describe a different schema to the generator and validator.
    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        let schema = schema.into();
        self.generator = QueryGenerator::new(self.llm.clone(), schema.clone());
        self.validator = Validator::new(self.llm.clone(), self.executor.clone(), schema, self.settings.sample_rows);
        self
    }

    /// Share an existing validation history.
    pub fn with_history(mut self, history: Arc<ValidationHistory>) -> Self {
        self.history = history;
        self
    }

    pub fn history(&self) -> &Arc<ValidationHistory> {
        &self.history
    }

    pub fn chat_store(&self) -> &Arc<dyn ChatStore> {
        &self.chat_store
    }

    /// Run one request, publishing progress to `bus`, and close the bus.
    ///
    /// The caller opens the bus (or starts consuming) before calling this;
    /// events published to a closed bus are dropped.
    pub async fn process(&self, request: Request, bus: &EventBus) -> ProcessingResult {
        let _guard = StreamGuard(bus);
        let emit = Emitter {
            bus,
            correlation_id: request.session_id.as_deref(),
        };
        self.run(&request, &emit).await
    }

    async fn run(&self, request: &Request, emit: &Emitter<'_>) -> ProcessingResult {
        info!(session_id = ?request.session_id, "Processing request");
        emit.status(format!("Start processing query: '{}'", preview(&request.user_message, 50)));
        emit.thinking("Analyzing query intent...");

        let turns = match self.chat_store.recent(self.settings.chat_history_limit).await {
            Ok(turns) => turns,
            Err(e) => {
                warn!("Chat history unavailable, resolving without it: {e}");
                Vec::new()
            }
        };

        let resolution = self.resolver.resolve(&request.user_message, &turns).await;
        if resolution.strategy == ResolutionStrategy::ContextRewrite {
            emit.thinking(format!("Using conversation context: {}", resolution.message));
        }
        let resolved = Request {
            user_message: resolution.message,
            session_id: request.session_id.clone(),
        };

        let decision = match self.router.route(&resolved.user_message).await {
            Ok(decision) => decision,
            Err(e) => {
                error!("Routing failed: {e}");
                let message = format!("Routing failed: {e}");
                emit.error(message.clone());
                return ProcessingResult::failed(message, Vec::new(), 0);
            }
        };
        emit.status(format!(
            "Decision: {} (confidence: {:.2})",
            if decision.use_structured_pipeline { "SQL Agent" } else { "General Response" },
            decision.confidence
        ));

        if decision.use_structured_pipeline {
            self.query_loop(&resolved, &decision, emit).await
        } else {
            self.answer_directly(&resolved, emit).await
        }
    }

    async fn query_loop(&self, request: &Request, decision: &RoutingDecision, emit: &Emitter<'_>) -> ProcessingResult {
        let max = self.settings.max_iterations.max(1);
        let threshold = self.settings.confidence_threshold;
        let intent = request.user_message.as_str();

        let mut steps = Vec::with_capacity(max);
        let mut feedback = Feedback::default();
        let mut best: Option<(CandidateQuery, ValidationOutcome)> = None;

        emit.status("Processing with SQL Agent...");

        for iteration in 1..=max {
            emit.thinking(format!("Generating query (attempt {iteration}/{max})..."));
            let recent = self.history.recent(self.settings.recent_history_window);

            let candidate = match self.generator.generate(intent, decision, &feedback, &recent).await {
                Ok(candidate) => candidate,
                Err(e) => {
                    warn!(iteration, "Query generation failed: {e}");
                    emit.error(format!("Query generation failed: {e}"));
                    steps.push(format!("Iteration {iteration}: generation failed: {e}"));
                    continue;
                }
            };
            emit.event(
                EventKind::QueryEmitted,
                format!("Generated query (confidence: {:.2})", candidate.confidence),
                json!({
                    "iteration": iteration,
                    "statement": candidate.statement,
                    "explanation": candidate.explanation,
                    "confidence": candidate.confidence,
                    "referenced_entities": candidate.referenced_entities,
                }),
            );

            emit.thinking("Validating query...");
            let outcome = match self.validator.validate(intent, &candidate).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!(iteration, "Validation judgment failed: {e}");
                    emit.error(format!("Validation failed: {e}"));
                    steps.push(format!("Iteration {iteration}: validation failed: {e}"));
                    continue;
                }
            };

            if outcome.executed() {
                emit.thinking(format!("Retrieved {} records", outcome.rows.len()));
            }
            self.history
                .record(ValidationHistoryEntry::new(intent, &candidate.statement, &outcome));
            emit.event(
                EventKind::ValidationOutcome,
                format!(
                    "Validation: {} (confidence: {:.2})",
                    if outcome.valid { "valid" } else { "invalid" },
                    outcome.confidence
                ),
                json!({
                    "iteration": iteration,
                    "valid": outcome.valid,
                    "confidence": outcome.confidence,
                    "details": outcome.details,
                    "error": outcome.error,
                    "security_violation": outcome.security_violation,
                    "row_count": outcome.rows.len(),
                    "improvement_suggestions": outcome.improvement_suggestions,
                }),
            );
            steps.push(step_entry(iteration, &candidate, &outcome));
            info!(iteration, valid = outcome.valid, confidence = outcome.confidence, "Attempt validated");

            if outcome.security_violation {
                let violation = outcome.error.clone().unwrap_or_else(|| outcome.details.clone());
                emit.error(violation.clone());
                return ProcessingResult {
                    success: outcome.valid,
                    statement: Some(candidate.statement),
                    explanation: Some(candidate.explanation),
                    outcome: Some(outcome),
                    error: Some(violation),
                    steps,
                    summary: None,
                    attempts: iteration,
                };
            }

            if outcome.meets(threshold) {
                emit.status(format!("Query accepted on attempt {iteration}"));
                return self.accept(request, candidate, outcome, steps, iteration, emit).await;
            }

            feedback = Feedback::from_outcome(&outcome);
            let improves = best.as_ref().is_none_or(|(_, b)| outcome.confidence > b.confidence);
            if outcome.valid && outcome.executed() && improves {
                best = Some((candidate, outcome));
            }
        }

        warn!(attempts = max, "Iteration limit reached without an accepted query");
        match best {
            Some((candidate, outcome)) if outcome.confidence >= self.settings.fallback_confidence_threshold => {
                emit.status(format!(
                    "Using best attempt (confidence: {:.2}) after {max} attempts",
                    outcome.confidence
                ));
                self.accept(request, candidate, outcome, steps, max, emit).await
            }
            _ => {
                let message = AgentError::Exhausted(max).to_string();
                emit.error(message.clone());
                ProcessingResult::failed(message, steps, max)
            }
        }
    }

    async fn accept(
        &self,
        request: &Request,
        candidate: CandidateQuery,
        outcome: ValidationOutcome,
        steps: Vec<String>,
        attempts: usize,
        emit: &Emitter<'_>,
    ) -> ProcessingResult {
        let summary = self.enrich(request, &candidate, &outcome, emit).await;
        ProcessingResult {
            success: true,
            statement: Some(candidate.statement),
            explanation: Some(candidate.explanation),
            outcome: Some(outcome),
            error: None,
            steps,
            summary,
            attempts,
        }
    }

    /// Summary, data and channel messages. Each part fails on its own.
    async fn enrich(
        &self,
        request: &Request,
        candidate: &CandidateQuery,
        outcome: &ValidationOutcome,
        emit: &Emitter<'_>,
    ) -> Option<String> {
        emit.status("Analyzing your target audience...");
        let summary = match self
            .analyst
            .summarize(&request.user_message, candidate, outcome, |fragment| emit.partial(fragment))
            .await
        {
            Ok(text) => Some(text),
            Err(e) => {
                warn!("Summary failed: {e}");
                emit.error(format!("Summary unavailable: {e}"));
                None
            }
        };

        if !outcome.rows.is_empty() {
            emit.event(
                EventKind::DataRetrieved,
                format!("Retrieved {} records", outcome.rows.len()),
                json!({ "count": outcome.rows.len(), "rows": outcome.rows }),
            );
        }

        if self.settings.personalize {
            match self.personalizer.personalize(&request.user_message, &outcome.rows).await {
                Ok(Some(channels)) => emit.event(
                    EventKind::ChannelContent,
                    format!("Personalized messages for {} channel(s)", channels.len()),
                    json!({ "channels": channels }),
                ),
                Ok(None) => {}
                Err(e) => {
                    warn!("Personalization failed: {e}");
                    emit.error(format!("Message personalization failed: {e}"));
                }
            }
        }

        summary
    }

    async fn answer_directly(&self, request: &Request, emit: &Emitter<'_>) -> ProcessingResult {
        emit.status("Processing as general query...");
        match self
            .llm
            .stream(prompts::direct_answer(&request.user_message), |fragment| emit.partial(fragment))
            .await
        {
            Ok(answer) => ProcessingResult {
                success: true,
                summary: Some(answer),
                ..ProcessingResult::default()
            },
            Err(e) => {
                error!("Direct answer failed: {e}");
                let message = format!("Failed to generate response: {e}");
                emit.error(message.clone());
                ProcessingResult::failed(message, Vec::new(), 0)
            }
        }
    }
}

impl Drop for Orchestrator {
    fn drop(&mut self) {
        self.history.clear();
    }
}

fn step_entry(iteration: usize, candidate: &CandidateQuery, outcome: &ValidationOutcome) -> String {
    let mut entry = format!(
        "Iteration {iteration}: {} | valid: {} | confidence: {:.2}",
        candidate.statement, outcome.valid, outcome.confidence
    );
    if let Some(error) = &outcome.error {
        entry.push_str(&format!(" | error: {error}"));
    }
    entry
}
