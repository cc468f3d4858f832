//! Request entry point shared by the HTTP gateway and the CLI.
//!
//! [`ChatService::start`] opens a fresh bus per request, spawns the
//! pipeline as a producer task and hands back a [`ChatStream`]. If the
//! stream is dropped before `end_of_stream` (the client went away) the
//! producer is aborted. After a successful run the exchange is appended to
//! the chat transcript.

use futures::Stream;
use quarry_core::error::StorageError;
use quarry_core::event::{EventBus, EventStream, StreamEvent};
use quarry_core::storage::{ChatStore, ChatTurn};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::orchestrator::Orchestrator;
use crate::types::{ProcessingResult, Request};

#[derive(Clone)]
pub struct ChatService {
    orchestrator: Arc<Orchestrator>,
    poll_interval: Duration,
}

impl ChatService {
    pub fn new(orchestrator: Arc<Orchestrator>, poll_interval: Duration) -> Self {
        Self {
            orchestrator,
            poll_interval,
        }
    }

    fn chat_store(&self) -> &Arc<dyn ChatStore> {
        self.orchestrator.chat_store()
    }

    /// Start processing `request`. Must be called inside a Tokio runtime.
    pub fn start(&self, request: Request) -> ChatStream {
        let bus = Arc::new(EventBus::new(self.poll_interval));
        bus.open();
        let events = bus.consume();

        let orchestrator = self.orchestrator.clone();
        let producer = tokio::spawn(async move {
            let result = orchestrator.process(request.clone(), &bus).await;
            persist(orchestrator.chat_store().as_ref(), &request, &result).await;
            result
        });

        ChatStream {
            events,
            producer: Some(producer),
            finished: false,
        }
    }

    /// All persisted turns, oldest first.
    pub async fn history(&self) -> Result<Vec<ChatTurn>, StorageError> {
        self.chat_store().all().await
    }

    /// Clear the transcript and the in-process validation history.
    pub async fn clear_history(&self) -> Result<(), StorageError> {
        self.chat_store().clear().await?;
        self.orchestrator.history().clear();
        info!("Chat history cleared");
        Ok(())
    }
}

async fn persist(store: &dyn ChatStore, request: &Request, result: &ProcessingResult) {
    if !result.success {
        debug!("Not persisting failed request");
        return;
    }
    let turn = ChatTurn::new(request.user_message.clone(), result.transcript());
    if let Err(e) = store.append(turn).await {
        error!("Failed to persist chat turn: {e}");
    }
}

/// Events for one request, ending with `end_of_stream`.
pub struct ChatStream {
    events: EventStream,
    producer: Option<JoinHandle<ProcessingResult>>,
    finished: bool,
}

impl ChatStream {
    /// Wait for the producer and return its result.
    ///
    /// Call after draining the events; `None` if the producer panicked or
    /// was aborted.
    pub async fn finish(mut self) -> Option<ProcessingResult> {
        let producer = self.producer.take()?;
        match producer.await {
            Ok(result) => Some(result),
            Err(e) => {
                error!("Pipeline task failed: {e}");
                None
            }
        }
    }
}

impl Stream for ChatStream {
    type Item = StreamEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamEvent>> {
        let next = self.events.as_mut().poll_next(cx);
        match &next {
            Poll::Ready(Some(event)) if event.is_terminal() => self.finished = true,
            Poll::Ready(None) => self.finished = true,
            _ => {}
        }
        next
    }
}

impl Drop for ChatStream {
    fn drop(&mut self) {
        if !self.finished
            && let Some(producer) = &self.producer
        {
            debug!("Stream dropped before completion; aborting pipeline");
            producer.abort();
        }
    }
}
