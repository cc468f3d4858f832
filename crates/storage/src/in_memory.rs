//! In-memory chat store, useful for testing and ephemeral sessions.

use async_trait::async_trait;
use quarry_core::error::StorageError;
use quarry_core::storage::{ChatStore, ChatTurn};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Keeps chat turns in a Vec, oldest first.
#[derive(Default, Clone)]
pub struct InMemoryChatStore {
    turns: Arc<RwLock<Vec<ChatTurn>>>,
}

impl InMemoryChatStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ChatStore for InMemoryChatStore {
    fn name(&self) -> &str {
        "in_memory"
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ChatTurn>, StorageError> {
        let turns = self.turns.read().await;
        let start = turns.len().saturating_sub(limit);
        Ok(turns[start..].to_vec())
    }

    async fn all(&self) -> Result<Vec<ChatTurn>, StorageError> {
        Ok(self.turns.read().await.clone())
    }

    async fn append(&self, turn: ChatTurn) -> Result<(), StorageError> {
        self.turns.write().await.push(turn);
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        self.turns.write().await.clear();
        Ok(())
    }
}
