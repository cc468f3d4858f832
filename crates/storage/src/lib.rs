//! Storage implementations for Quarry: read-only statement executors and
//! chat transcript stores.

pub mod in_memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

pub use in_memory::InMemoryChatStore;

#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteChatStore, SqliteExecutor};

#[cfg(feature = "postgres")]
pub use postgres::PostgresExecutor;

use quarry_core::error::StorageError;
use quarry_core::storage::QueryExecutor;
use std::sync::Arc;

/// Connect the executor matching the URL scheme.
pub async fn connect_executor(
    url: &str,
    max_connections: u32,
) -> Result<Arc<dyn QueryExecutor>, StorageError> {
    #[cfg(feature = "postgres")]
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        return Ok(Arc::new(PostgresExecutor::connect(url, max_connections).await?));
    }

    #[cfg(feature = "sqlite")]
    if url.starts_with("sqlite:") {
        let _ = max_connections;
        return Ok(Arc::new(SqliteExecutor::connect(url).await?));
    }

    Err(StorageError::Connection(format!(
        "unsupported database URL scheme: {}",
        url.split(':').next().unwrap_or_default()
    )))
}
