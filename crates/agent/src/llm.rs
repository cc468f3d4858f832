//! Thin client over the configured [`Provider`] used by every stage.
//!
//! All calls run under the pipeline's completion timeout. Structured calls
//! go through [`LlmClient::complete_json`]; user-facing text through
//! [`LlmClient::stream`].

use quarry_core::error::ProviderError;
use quarry_core::message::Message;
use quarry_core::provider::{Provider, ProviderRequest, complete_text};
use serde::de::DeserializeOwned;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use crate::error::AgentError;
use crate::extract;

/// One system + user exchange and its generation parameters.
#[derive(Debug, Clone)]
pub struct Prompt {
    pub system: String,
    pub user: String,
    pub temperature: f32,
    pub max_tokens: Option<u32>,
}

impl Prompt {
    pub fn new(system: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            user: user.into(),
            temperature: 0.7,
            max_tokens: None,
        }
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }
}

#[derive(Clone)]
pub struct LlmClient {
    provider: Arc<dyn Provider>,
    model: String,
    timeout: Duration,
}

impl LlmClient {
    pub fn new(provider: Arc<dyn Provider>, model: impl Into<String>, timeout: Duration) -> Self {
        Self {
            provider,
            model: model.into(),
            timeout,
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn request(&self, prompt: Prompt) -> ProviderRequest {
        let mut request = ProviderRequest::new(
            self.model.clone(),
            vec![Message::system(prompt.system), Message::user(prompt.user)],
        )
        .with_temperature(prompt.temperature);
        if let Some(max_tokens) = prompt.max_tokens {
            request = request.with_max_tokens(max_tokens);
        }
        request
    }

    /// Complete and return the trimmed, non-empty text.
    pub async fn complete(&self, prompt: Prompt) -> Result<String, ProviderError> {
        complete_text(self.provider.as_ref(), self.request(prompt), self.timeout).await
    }

    /// Complete and parse the JSON the model was asked for.
    pub async fn complete_json<T: DeserializeOwned>(&self, prompt: Prompt) -> Result<T, AgentError> {
        let text = self.complete(prompt).await?;
        extract::parse_json(&text).map_err(|e| {
            debug!(error = %e, output = %text, "Unparseable model output");
            AgentError::from(e)
        })
    }

    /// Stream the completion, handing each fragment to `on_fragment`.
    ///
    /// Returns the full text. Each wait (for the stream and for every
    /// fragment) is bounded by the completion timeout.
    pub async fn stream<F>(&self, prompt: Prompt, mut on_fragment: F) -> Result<String, ProviderError>
    where
        F: FnMut(&str) + Send,
    {
        let request = self.request(prompt).streaming();
        let mut rx = tokio::time::timeout(self.timeout, self.provider.stream(request))
            .await
            .map_err(|_| self.timed_out())??;

        let mut text = String::new();
        loop {
            let next = tokio::time::timeout(self.timeout, rx.recv())
                .await
                .map_err(|_| self.timed_out())?;
            let Some(chunk) = next else { break };
            let chunk = chunk?;
            if let Some(content) = chunk.content.as_deref().filter(|c| !c.is_empty()) {
                on_fragment(content);
                text.push_str(content);
            }
            if chunk.done {
                break;
            }
        }

        if text.trim().is_empty() {
            return Err(ProviderError::EmptyCompletion);
        }
        Ok(text)
    }

    fn timed_out(&self) -> ProviderError {
        ProviderError::Timeout(format!("no completion within {}s", self.timeout.as_secs()))
    }
}
