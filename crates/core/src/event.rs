//! Progress events and the single-consumer event bus.
//!
//! A pipeline runs as a background producer and publishes typed
//! [`StreamEvent`]s; one consumer drains them through [`EventBus::consume`]
//! and forwards them to the client. The bus owns the streaming lifecycle:
//!
//! - `open()` starts a stream and discards leftovers from a stream that was
//!   never drained
//! - `publish()` is ignored unless a stream is open (`end_of_stream` is always
//!   accepted so a lingering consumer can terminate)
//! - `close()` enqueues the terminal `end_of_stream` event
//!
//! A single mutex guards the flag and the queue and is never held across an
//! await point. Waiting consumers are woken through a [`Notify`], with a
//! bounded wait so a cancelled consumer is observed promptly.

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{debug, warn};

/// What a [`StreamEvent`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A pipeline stage started or finished
    Status,
    /// Intermediate reasoning ("Generating query...")
    Thinking,
    /// A fragment of the user-facing answer
    PartialAnswer,
    /// A candidate statement was produced
    QueryEmitted,
    /// A candidate statement was judged
    ValidationOutcome,
    /// Records matching the accepted statement
    DataRetrieved,
    /// Personalized outbound channel messages
    ChannelContent,
    Error,
    /// Always the last event of a stream
    EndOfStream,
}

impl EventKind {
    /// Wire name for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Status => "status",
            Self::Thinking => "thinking",
            Self::PartialAnswer => "partial_answer",
            Self::QueryEmitted => "query_emitted",
            Self::ValidationOutcome => "validation_outcome",
            Self::DataRetrieved => "data_retrieved",
            Self::ChannelContent => "channel_content",
            Self::Error => "error",
            Self::EndOfStream => "end_of_stream",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A typed progress event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamEvent {
    pub kind: EventKind,

    /// Human-readable text
    pub content: String,

    /// Structured data (statement, rows, outcome, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Map<String, serde_json::Value>>,

    /// Ties the event to the request that produced it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,

    pub timestamp: DateTime<Utc>,
}

impl StreamEvent {
    pub fn new(kind: EventKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
            payload: None,
            correlation_id: None,
            timestamp: Utc::now(),
        }
    }

    pub fn status(content: impl Into<String>) -> Self {
        Self::new(EventKind::Status, content)
    }

    pub fn thinking(content: impl Into<String>) -> Self {
        Self::new(EventKind::Thinking, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(EventKind::Error, content)
    }

    pub fn end_of_stream() -> Self {
        Self::new(EventKind::EndOfStream, "Stream completed")
    }

    /// Attach a payload. Non-object values are wrapped as `{"value": ...}`.
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(match payload {
            serde_json::Value::Object(map) => map,
            other => {
                let mut map = serde_json::Map::new();
                map.insert("value".into(), other);
                map
            }
        });
        self
    }

    pub fn with_correlation_id(mut self, id: Option<&str>) -> Self {
        self.correlation_id = id.map(String::from);
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.kind == EventKind::EndOfStream
    }

    /// Serialize into a wire frame.
    pub fn to_frame(&self) -> Result<SseFrame, serde_json::Error> {
        Ok(SseFrame {
            event: self.kind.as_str(),
            data: serde_json::to_string(self)?,
        })
    }
}

/// One framed record: the event kind and its JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct SseFrame {
    pub event: &'static str,
    pub data: String,
}

impl SseFrame {
    /// `kind: payload` line form used by line-oriented clients.
    pub fn to_line(&self) -> String {
        format!("{}: {}", self.event, self.data)
    }

    /// Frame `event`, substituting an `error` frame (or a bare
    /// `end_of_stream`) if it cannot be serialized.
    pub fn from_event(event: &StreamEvent) -> Self {
        match event.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!(kind = %event.kind, error = %e, "Event serialization failed");
                Self::substitute_for(event, &e.to_string())
            }
        }
    }

    /// Frame used when an event could not be serialized.
    fn substitute_for(event: &StreamEvent, reason: &str) -> Self {
        let replacement = if event.is_terminal() {
            StreamEvent::end_of_stream()
        } else {
            StreamEvent::error(format!("Failed to serialize {} event: {reason}", event.kind))
        };
        let data = serde_json::to_string(&replacement).unwrap_or_else(|_| {
            format!(r#"{{"kind":"{}","content":"unserializable event"}}"#, replacement.kind)
        });
        Self {
            event: replacement.kind.as_str(),
            data,
        }
    }
}

/// A boxed stream of events, owned by the consumer.
pub type EventStream = Pin<Box<dyn Stream<Item = StreamEvent> + Send>>;

/// A boxed stream of wire frames.
pub type FrameStream = Pin<Box<dyn Stream<Item = SseFrame> + Send>>;

#[derive(Debug, Default)]
struct BusState {
    streaming: bool,
    queue: VecDeque<StreamEvent>,
}

/// Process-local, single-consumer progress channel.
pub struct EventBus {
    state: Mutex<BusState>,
    notify: Notify,
    poll_interval: Duration,
}

impl EventBus {
    /// Create a bus whose consumer re-checks the queue at least every `poll_interval`.
    pub fn new(poll_interval: Duration) -> Self {
        Self {
            state: Mutex::new(BusState::default()),
            notify: Notify::new(),
            poll_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BusState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Start streaming. Stale events left by an undrained stream are dropped.
    /// Does nothing if a stream is already open.
    pub fn open(&self) {
        let mut state = self.lock();
        if !state.streaming {
            let stale = state.queue.len();
            state.queue.clear();
            state.streaming = true;
            if stale > 0 {
                debug!(stale, "Discarded events from an undrained stream");
            }
        }
    }

    /// Enqueue an event. Returns whether it was accepted.
    pub fn publish(&self, event: StreamEvent) -> bool {
        {
            let mut state = self.lock();
            if !state.streaming && !event.is_terminal() {
                debug!(kind = %event.kind, "Dropping event published outside a stream");
                return false;
            }
            state.queue.push_back(event);
        }
        self.notify.notify_one();
        true
    }

    /// Enqueue `end_of_stream` and stop accepting events.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            if !state.streaming {
                warn!("close() called while not streaming");
                return;
            }
            state.queue.push_back(StreamEvent::end_of_stream());
            state.streaming = false;
        }
        self.notify.notify_one();
    }

    pub fn is_streaming(&self) -> bool {
        self.lock().streaming
    }

    /// Number of queued, undelivered events.
    pub fn pending(&self) -> usize {
        self.lock().queue.len()
    }

    fn stop(&self) {
        self.lock().streaming = false;
    }

    fn next_ready(&self) -> Next {
        let mut state = self.lock();
        match state.queue.pop_front() {
            Some(event) => Next::Event(event),
            None if !state.streaming => Next::Finished,
            None => Next::Empty,
        }
    }

    /// Open the bus and drain it as a lazy stream.
    ///
    /// The stream ends right after `end_of_stream`, or as soon as the queue is
    /// empty and the bus is no longer streaming. Dropping the stream stops the
    /// bus, so a producer that outlives its consumer publishes into nothing.
    pub fn consume(self: &Arc<Self>) -> EventStream {
        self.open();
        let drain = Drain {
            bus: self.clone(),
            finished: false,
            _stop: StopOnDrop(self.clone()),
        };

        Box::pin(futures::stream::unfold(drain, |mut drain| async move {
            loop {
                if drain.finished {
                    return None;
                }
                match drain.bus.next_ready() {
                    Next::Event(event) => {
                        drain.finished = event.is_terminal();
                        return Some((event, drain));
                    }
                    Next::Finished => return None,
                    Next::Empty => {
                        let _ = tokio::time::timeout(
                            drain.bus.poll_interval,
                            drain.bus.notify.notified(),
                        )
                        .await;
                    }
                }
            }
        }))
    }

    /// [`consume`](Self::consume) mapped to wire frames.
    ///
    /// An event that fails to serialize is logged and replaced by an `error`
    /// frame; the stream itself keeps going.
    pub fn frames(self: &Arc<Self>) -> FrameStream {
        use futures::StreamExt;

        Box::pin(self.consume().map(|event| SseFrame::from_event(&event)))
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(Duration::from_millis(10))
    }
}

enum Next {
    Event(StreamEvent),
    Empty,
    Finished,
}

struct Drain {
    bus: Arc<EventBus>,
    finished: bool,
    _stop: StopOnDrop,
}

struct StopOnDrop(Arc<EventBus>);

impl Drop for StopOnDrop {
    fn drop(&mut self) {
        self.0.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    fn bus() -> Arc<EventBus> {
        Arc::new(EventBus::new(Duration::from_millis(5)))
    }

    #[test]
    fn publish_before_open_is_dropped() {
        let bus = bus();
        assert!(!bus.publish(StreamEvent::status("too early")));
        assert_eq!(bus.pending(), 0);
    }

    #[test]
    fn end_of_stream_always_accepted() {
        let bus = bus();
        assert!(bus.publish(StreamEvent::end_of_stream()));
        assert_eq!(bus.pending(), 1);
    }

    #[test]
    fn open_discards_stale_events() {
        let bus = bus();
        bus.publish(StreamEvent::end_of_stream());
        bus.open();
        assert_eq!(bus.pending(), 0);
        assert!(bus.is_streaming());
    }

    #[test]
    fn open_is_idempotent_while_streaming() {
        let bus = bus();
        bus.open();
        bus.publish(StreamEvent::status("kept"));
        bus.open();
        assert_eq!(bus.pending(), 1);
    }

    #[test]
    fn close_when_not_streaming_is_noop() {
        let bus = bus();
        bus.close();
        assert_eq!(bus.pending(), 0);

        bus.open();
        bus.close();
        bus.close();
        assert_eq!(bus.pending(), 1);
        assert!(!bus.is_streaming());
    }

    #[tokio::test]
    async fn consume_preserves_order_and_ends_once() {
        let bus = bus();
        bus.open();

        let producer = {
            let bus = bus.clone();
            tokio::spawn(async move {
                for i in 0..20 {
                    bus.publish(StreamEvent::thinking(format!("step {i}")));
                    if i % 5 == 0 {
                        tokio::time::sleep(Duration::from_millis(2)).await;
                    }
                }
                bus.close();
                bus.publish(StreamEvent::status("after close"));
            })
        };

        let events: Vec<StreamEvent> = bus.consume().collect().await;
        producer.await.unwrap();

        assert_eq!(events.len(), 21);
        for (i, event) in events.iter().take(20).enumerate() {
            assert_eq!(event.content, format!("step {i}"));
        }
        let terminal = events.iter().filter(|e| e.is_terminal()).count();
        assert_eq!(terminal, 1);
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn nothing_delivered_after_end_of_stream() {
        let bus = bus();
        bus.open();
        bus.close();
        // A stray terminal event lands behind the first one.
        bus.publish(StreamEvent::end_of_stream());

        let mut stream = bus.consume();
        // consume() re-opened a closed bus, so the queued events were stale.
        bus.publish(StreamEvent::status("fresh"));
        bus.close();
        bus.publish(StreamEvent::end_of_stream());

        let first = stream.next().await.unwrap();
        assert_eq!(first.content, "fresh");
        assert!(stream.next().await.unwrap().is_terminal());
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn dropping_consumer_stops_the_bus() {
        let bus = bus();
        let stream = bus.consume();
        assert!(bus.is_streaming());
        drop(stream);
        assert!(!bus.is_streaming());
        assert!(!bus.publish(StreamEvent::status("nobody listening")));
    }

    #[tokio::test]
    async fn frames_end_with_end_of_stream() {
        let bus = bus();
        bus.open();
        bus.publish(
            StreamEvent::new(EventKind::QueryEmitted, "candidate")
                .with_payload(serde_json::json!({"statement": "SELECT 1"}))
                .with_correlation_id(Some("req-1")),
        );
        bus.close();

        let frames: Vec<SseFrame> = bus.frames().collect().await;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].event, "query_emitted");
        assert!(frames[0].data.contains("SELECT 1"));
        assert!(frames[0].data.contains("req-1"));
        assert_eq!(frames[1].event, "end_of_stream");
        assert!(frames[1].to_line().starts_with("end_of_stream: {"));
    }

    #[test]
    fn substitute_frame_keeps_terminal_kind() {
        let frame = SseFrame::substitute_for(&StreamEvent::end_of_stream(), "boom");
        assert_eq!(frame.event, "end_of_stream");
        let frame = SseFrame::substitute_for(&StreamEvent::status("x"), "boom");
        assert_eq!(frame.event, "error");
        assert!(frame.data.contains("boom"));
    }

    #[test]
    fn scalar_payload_is_wrapped() {
        let event = StreamEvent::status("n").with_payload(serde_json::json!(3));
        assert_eq!(event.payload.unwrap()["value"], 3);
    }
}
