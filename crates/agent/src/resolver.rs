//! Context resolution: turn each incoming message into a standalone request.
//!
//! The resolver never fails. Every stage that can go wrong has a fallback:
//!
//! ```text
//! dependency analysis ── fails / standalone / no history ──▶ light rewrite ──▶ (original on failure)
//!        │ needs context
//!        ▼
//! context extraction ── NO_RELEVANT_CONTEXT ──▶ light rewrite
//!        │ fails ──▶ windowed context (last 3 turns)
//!        ▼
//! context-aware rewrite ──▶ (original on failure)
//! ```

use quarry_core::storage::ChatTurn;
use tracing::{debug, info, warn};

use crate::llm::LlmClient;
use crate::prompts;
use crate::types::{DependencyAnalysis, Resolution, ResolutionStrategy, clamp_confidence};

/// Turns shown in the windowed fallback context.
const WINDOW_TURNS: usize = 3;

/// Longest answer preview in the windowed fallback context.
const ANSWER_PREVIEW_CHARS: usize = 150;

pub struct ContextResolver {
    llm: LlmClient,
}

impl ContextResolver {
    pub fn new(llm: LlmClient) -> Self {
        Self { llm }
    }

    /// Resolve `message` against prior turns (oldest first).
    pub async fn resolve(&self, message: &str, history: &[ChatTurn]) -> Resolution {
        let analysis = match self.analyze(message).await {
            Ok(analysis) => {
                debug!(
                    needs_context = analysis.needs_context,
                    confidence = analysis.confidence,
                    reasoning = %analysis.reasoning,
                    "Dependency analysis"
                );
                Some(analysis)
            }
            Err(e) => {
                warn!("Dependency analysis failed, treating message as standalone: {e}");
                None
            }
        };

        let needs_context = analysis.as_ref().is_some_and(|a| a.needs_context);
        if !needs_context || history.is_empty() {
            return self.light_rewrite(message, analysis).await;
        }

        let context = match self.extract_context(message, history).await {
            Ok(Some(context)) => context,
            Ok(None) => {
                info!("No relevant earlier context found");
                return self.light_rewrite(message, analysis).await;
            }
            Err(e) => {
                warn!("Context extraction failed, using recent turns: {e}");
                windowed_context(history)
            }
        };

        match self.llm.complete(prompts::context_rewrite(&context, message)).await {
            Ok(rewritten) => {
                info!(original = %message, rewritten = %rewritten, "Message rewritten with context");
                Resolution {
                    message: rewritten,
                    strategy: ResolutionStrategy::ContextRewrite,
                    analysis,
                }
            }
            Err(e) => {
                warn!("Context rewrite failed, keeping original message: {e}");
                unchanged(message, analysis)
            }
        }
    }

    async fn analyze(&self, message: &str) -> Result<DependencyAnalysis, crate::AgentError> {
        let mut analysis: DependencyAnalysis = self.llm.complete_json(prompts::dependency_analysis(message)).await?;
        analysis.confidence = clamp_confidence(analysis.confidence);
        Ok(analysis)
    }

    async fn extract_context(
        &self,
        message: &str,
        history: &[ChatTurn],
    ) -> Result<Option<String>, quarry_core::ProviderError> {
        let prompt = prompts::context_extraction(message, &numbered_messages(history));
        let context = match self.llm.complete(prompt).await {
            Ok(context) => context,
            Err(quarry_core::ProviderError::EmptyCompletion) => return Ok(None),
            Err(e) => return Err(e),
        };
        if context.contains(prompts::NO_RELEVANT_CONTEXT) {
            return Ok(None);
        }
        Ok(Some(context))
    }

    async fn light_rewrite(&self, message: &str, analysis: Option<DependencyAnalysis>) -> Resolution {
        match self.llm.complete(prompts::light_rewrite(message)).await {
            Ok(rewritten) if rewritten != message.trim() => Resolution {
                message: rewritten,
                strategy: ResolutionStrategy::LightRewrite,
                analysis,
            },
            Ok(_) => unchanged(message, analysis),
            Err(e) => {
                debug!("Light rewrite failed, keeping original message: {e}");
                unchanged(message, analysis)
            }
        }
    }
}

fn unchanged(message: &str, analysis: Option<DependencyAnalysis>) -> Resolution {
    Resolution {
        message: message.to_string(),
        strategy: ResolutionStrategy::Unchanged,
        analysis,
    }
}

/// Prior user messages, newest first, numbered so the newest has the
/// highest number.
fn numbered_messages(history: &[ChatTurn]) -> String {
    let total = history.len();
    history
        .iter()
        .rev()
        .enumerate()
        .map(|(i, turn)| format!("[{}] {}", total - i, turn.message))
        .collect::<Vec<_>>()
        .join("\n")
}

/// The last few turns as plain `Previous Q:` / `Previous A:` lines.
fn windowed_context(history: &[ChatTurn]) -> String {
    history
        .iter()
        .rev()
        .take(WINDOW_TURNS)
        .map(|turn| {
            format!(
                "Previous Q: {}\nPrevious A: {}",
                turn.message,
                preview(&turn.response, ANSWER_PREVIEW_CHARS)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

pub(crate) fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}...")
}
