//! # Quarry Core
//!
//! Domain types, traits, and error definitions for the Quarry engine.
//! This crate has **no framework dependencies**: it defines the model that
//! the provider, storage, agent and gateway crates implement against.
//!
//! ## Seams
//!
//! - [`Provider`]: the text-completion service (complete or stream)
//! - [`QueryExecutor`]: read-only statement execution against storage
//! - [`ChatStore`]: persisted conversation turns
//! - [`EventBus`]: the single-consumer progress feed between a pipeline
//!   and the client stream

pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod storage;

// Re-export key types at crate root for ergonomics
pub use error::{Error, ProviderError, Result, StorageError};
pub use event::{EventBus, EventKind, EventStream, FrameStream, SseFrame, StreamEvent};
pub use message::{Message, Role};
pub use provider::{Provider, ProviderRequest, ProviderResponse, StreamChunk, Usage};
pub use storage::{ChatStore, ChatTurn, QueryExecutor, Row};
