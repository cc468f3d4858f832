//! Storage seams: read-only statement execution and persisted chat turns.
//!
//! The pipeline never talks to a database directly. It executes candidate
//! statements through a [`QueryExecutor`] and reads prior conversation turns
//! through a [`ChatStore`]. Implementations live in `quarry-storage`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::StorageError;

/// One result record: column name → value, in select-list order.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Executes a single read-only statement.
///
/// Each call is its own transaction. A failed call must leave the executor
/// usable for the next one.
#[async_trait]
pub trait QueryExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn execute(&self, statement: &str) -> Result<Vec<Row>, StorageError>;
}

/// A persisted prior exchange.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub id: String,
    /// What the user asked
    pub message: String,
    /// What was answered
    pub response: String,
    pub created_at: DateTime<Utc>,
}

impl ChatTurn {
    pub fn new(message: impl Into<String>, response: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            message: message.into(),
            response: response.into(),
            created_at: Utc::now(),
        }
    }
}

/// Transcript persistence.
#[async_trait]
pub trait ChatStore: Send + Sync {
    fn name(&self) -> &str;

    /// The most recent `limit` turns, ordered oldest to newest.
    async fn recent(&self, limit: usize) -> Result<Vec<ChatTurn>, StorageError>;

    /// Every turn, ordered oldest to newest.
    async fn all(&self) -> Result<Vec<ChatTurn>, StorageError>;

    async fn append(&self, turn: ChatTurn) -> Result<(), StorageError>;

    async fn clear(&self) -> Result<(), StorageError>;
}
