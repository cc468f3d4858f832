//! Scripted collaborators for pipeline tests.

use async_trait::async_trait;
use quarry_core::error::{ProviderError, StorageError};
use quarry_core::message::Message;
use quarry_core::provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk};
use quarry_core::storage::{QueryExecutor, Row};
use std::collections::VecDeque;
use std::sync::Mutex;

type Reply = Result<String, ProviderError>;

/// A mock provider that answers by matching the system prompt.
///
/// Each rule pairs a marker (a substring of the system message) with a
/// queue of replies. The last reply in a queue repeats once the others are
/// used up. Requests no rule matches get the fallback reply, or an API
/// error when none is set.
#[derive(Default)]
pub struct ScriptedProvider {
    rules: Mutex<Vec<(String, VecDeque<Reply>)>>,
    fallback: Option<String>,
    requests: Mutex<Vec<ProviderRequest>>,
}

impl ScriptedProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(self, marker: &str, reply: impl Into<String>) -> Self {
        self.push(marker, Ok(reply.into()))
    }

    pub fn fail_on(self, marker: &str) -> Self {
        self.push(
            marker,
            Err(ProviderError::ApiError {
                status_code: 500,
                message: "scripted failure".into(),
            }),
        )
    }

    pub fn reply_any(mut self, reply: impl Into<String>) -> Self {
        self.fallback = Some(reply.into());
        self
    }

    fn push(self, marker: &str, reply: Reply) -> Self {
        {
            let mut rules = self.rules.lock().unwrap();
            match rules.iter_mut().find(|(m, _)| m == marker) {
                Some((_, queue)) => queue.push_back(reply),
                None => rules.push((marker.to_string(), VecDeque::from([reply]))),
            }
        }
        self
    }

    pub fn requests(&self) -> Vec<ProviderRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests whose system prompt contains `marker`.
    pub fn requests_for(&self, marker: &str) -> Vec<ProviderRequest> {
        self.requests()
            .into_iter()
            .filter(|r| system_text(r).contains(marker))
            .collect()
    }

    pub fn calls(&self, marker: &str) -> usize {
        self.requests_for(marker).len()
    }

    fn answer(&self, request: &ProviderRequest) -> Reply {
        self.requests.lock().unwrap().push(request.clone());
        let system = system_text(request);

        let mut rules = self.rules.lock().unwrap();
        if let Some((_, queue)) = rules.iter_mut().find(|(m, _)| system.contains(m.as_str())) {
            return if queue.len() > 1 {
                queue.pop_front().unwrap()
            } else {
                queue.front().cloned().unwrap()
            };
        }

        self.fallback.clone().ok_or(ProviderError::ApiError {
            status_code: 500,
            message: format!("no scripted reply for: {}", system.lines().next().unwrap_or("")),
        })
    }
}

fn system_text(request: &ProviderRequest) -> String {
    request.messages.first().map(|m| m.content.clone()).unwrap_or_default()
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, request: ProviderRequest) -> Result<ProviderResponse, ProviderError> {
        let text = self.answer(&request)?;
        Ok(ProviderResponse {
            message: Message::assistant(text),
            usage: None,
            model: request.model,
        })
    }

    async fn stream(
        &self,
        request: ProviderRequest,
    ) -> Result<tokio::sync::mpsc::Receiver<Result<StreamChunk, ProviderError>>, ProviderError> {
        let text = self.answer(&request)?;
        let pieces: Vec<String> = text.split_inclusive(' ').map(String::from).collect();
        let (tx, rx) = tokio::sync::mpsc::channel(pieces.len() + 1);
        for piece in pieces {
            let _ = tx
                .send(Ok(StreamChunk {
                    content: Some(piece),
                    done: false,
                    usage: None,
                }))
                .await;
        }
        let _ = tx
            .send(Ok(StreamChunk {
                content: None,
                done: true,
                usage: None,
            }))
            .await;
        Ok(rx)
    }
}

/// An executor returning canned rows, failing for statements that contain
/// a configured fragment.
#[derive(Default)]
pub struct ScriptedExecutor {
    rows: Vec<Row>,
    failures: Vec<(String, String)>,
    executed: Mutex<Vec<String>>,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(mut self, rows: Vec<Row>) -> Self {
        self.rows = rows;
        self
    }

    pub fn fail_when(mut self, fragment: &str, message: &str) -> Self {
        self.failures.push((fragment.to_string(), message.to_string()));
        self
    }

    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueryExecutor for ScriptedExecutor {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn execute(&self, statement: &str) -> Result<Vec<Row>, StorageError> {
        self.executed.lock().unwrap().push(statement.to_string());
        if let Some((_, message)) = self.failures.iter().find(|(f, _)| statement.contains(f.as_str())) {
            return Err(StorageError::QueryFailed(message.clone()));
        }
        Ok(self.rows.clone())
    }
}

/// Build a row from `(column, value)` pairs.
pub fn row(pairs: &[(&str, serde_json::Value)]) -> Row {
    pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}
