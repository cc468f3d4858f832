//! SQLite storage: a read-only statement executor and a chat transcript store.
//!
//! The executor runs each statement on one connection with
//! `PRAGMA query_only` switched on, inside a transaction that is always
//! rolled back. The chat store keeps turns in a single `chat_history` table.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quarry_core::error::StorageError;
use quarry_core::storage::{ChatStore, ChatTurn, QueryExecutor, Row};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow};
use sqlx::{Column, Connection, Row as _, SqlitePool, TypeInfo, ValueRef};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Open a SQLite pool.
///
/// Pass `"sqlite::memory:"` for an ephemeral database (useful for tests).
/// In-memory databases are private to one connection, so their pool is
/// capped at a single connection.
pub async fn open_pool(url: &str) -> Result<SqlitePool, StorageError> {
    let in_memory = url.contains(":memory:");
    let mut options = SqliteConnectOptions::from_str(url)
        .map_err(|e| StorageError::Connection(format!("Invalid SQLite URL: {e}")))?
        .create_if_missing(true);
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    SqlitePoolOptions::new()
        .max_connections(if in_memory { 1 } else { 4 })
        .connect_with(options)
        .await
        .map_err(|e| StorageError::Connection(format!("Failed to open SQLite: {e}")))
}

fn query_failed(e: sqlx::Error) -> StorageError {
    match e {
        sqlx::Error::Database(db) => StorageError::QueryFailed(db.message().to_string()),
        other => StorageError::QueryFailed(other.to_string()),
    }
}

/// Engine-side write refusals become [`StorageError::Rejected`].
fn execution_failed(e: sqlx::Error) -> StorageError {
    if let sqlx::Error::Database(db) = &e {
        if db.message().contains("readonly database") {
            return StorageError::Rejected(db.message().to_string());
        }
    }
    query_failed(e)
}

/// Executes read-only statements against a SQLite database.
pub struct SqliteExecutor {
    pool: SqlitePool,
}

impl SqliteExecutor {
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let pool = open_pool(url).await?;
        info!("SQLite executor connected");
        Ok(Self { pool })
    }

    /// Create from an existing pool (useful for seeding test data).
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    async fn run(conn: &mut sqlx::SqliteConnection, statement: &str) -> Result<Vec<Row>, StorageError> {
        let mut tx = conn.begin().await.map_err(query_failed)?;
        let result = sqlx::query(statement).fetch_all(&mut *tx).await;
        if let Err(e) = tx.rollback().await {
            warn!(error = %e, "Rollback failed");
        }
        result.map_err(execution_failed)?.iter().map(row_to_json).collect()
    }
}

#[async_trait]
impl QueryExecutor for SqliteExecutor {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn execute(&self, statement: &str) -> Result<Vec<Row>, StorageError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        sqlx::query("PRAGMA query_only = ON")
            .execute(&mut *conn)
            .await
            .map_err(query_failed)?;

        let result = Self::run(&mut *conn, statement).await;

        // The connection goes back to the pool either way.
        if let Err(e) = sqlx::query("PRAGMA query_only = OFF").execute(&mut *conn).await {
            warn!(error = %e, "Failed to reset query_only; detaching connection");
            conn.detach();
        }

        if let Ok(rows) = &result {
            debug!(rows = rows.len(), "SQLite statement executed");
        }
        result
    }
}

/// Convert a row into a JSON object keyed by column name.
///
/// SQLite values carry their own storage class, which decides the JSON type.
fn row_to_json(row: &SqliteRow) -> Result<Row, StorageError> {
    let mut out = Row::new();
    for (i, column) in row.columns().iter().enumerate() {
        let raw = row.try_get_raw(i).map_err(query_failed)?;
        let value = if raw.is_null() {
            Value::Null
        } else {
            let storage_class = raw.type_info().name().to_string();
            match storage_class.as_str() {
                "INTEGER" | "BOOLEAN" => Value::from(row.try_get_unchecked::<i64, _>(i).map_err(query_failed)?),
                "REAL" | "NUMERIC" => row
                    .try_get_unchecked::<f64, _>(i)
                    .map(Value::from)
                    .map_err(query_failed)?,
                "BLOB" => {
                    let bytes = row.try_get_unchecked::<Vec<u8>, _>(i).map_err(query_failed)?;
                    Value::String(String::from_utf8_lossy(&bytes).into_owned())
                }
                _ => Value::String(row.try_get_unchecked::<String, _>(i).map_err(query_failed)?),
            }
        };
        insert_column(&mut out, column.name(), value);
    }
    Ok(out)
}

/// Repeated column names (`SELECT c.id, o.id`) get `_2`, `_3`, ... suffixes
/// instead of overwriting the earlier value.
fn insert_column(row: &mut Row, name: &str, value: Value) {
    if !row.contains_key(name) {
        row.insert(name.to_string(), value);
        return;
    }
    let key = (2..)
        .map(|n| format!("{name}_{n}"))
        .find(|candidate| !row.contains_key(candidate))
        .unwrap_or_else(|| name.to_string());
    debug!(column = name, key = %key, "Duplicate column name renamed");
    row.insert(key, value);
}

/// Chat transcripts in SQLite.
pub struct SqliteChatStore {
    pool: SqlitePool,
}

impl SqliteChatStore {
    /// Open (and migrate) the store at `url`.
    pub async fn new(url: &str) -> Result<Self, StorageError> {
        let store = Self {
            pool: open_pool(url).await?,
        };
        store.run_migrations().await?;
        info!("SQLite chat store initialized");
        Ok(store)
    }

    /// Create from an existing pool (useful for testing).
    pub async fn from_pool(pool: SqlitePool) -> Result<Self, StorageError> {
        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chat_history (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                id          TEXT UNIQUE NOT NULL,
                message     TEXT NOT NULL,
                response    TEXT NOT NULL,
                created_at  TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::MigrationFailed(format!("chat_history table: {e}")))?;

        Ok(())
    }
}

fn row_to_turn(row: &SqliteRow) -> Result<ChatTurn, StorageError> {
    let created_at: String = row.try_get("created_at").map_err(query_failed)?;
    let created_at = DateTime::parse_from_rfc3339(&created_at)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StorageError::QueryFailed(format!("bad created_at: {e}")))?;

    Ok(ChatTurn {
        id: row.try_get("id").map_err(query_failed)?,
        message: row.try_get("message").map_err(query_failed)?,
        response: row.try_get("response").map_err(query_failed)?,
        created_at,
    })
}

#[async_trait]
impl ChatStore for SqliteChatStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    async fn recent(&self, limit: usize) -> Result<Vec<ChatTurn>, StorageError> {
        let rows = sqlx::query(
            "SELECT id, message, response, created_at FROM chat_history ORDER BY seq DESC LIMIT ?",
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&self.pool)
        .await
        .map_err(query_failed)?;

        let mut turns = rows.iter().map(row_to_turn).collect::<Result<Vec<_>, _>>()?;
        turns.reverse();
        Ok(turns)
    }

    async fn all(&self) -> Result<Vec<ChatTurn>, StorageError> {
        let rows = sqlx::query("SELECT id, message, response, created_at FROM chat_history ORDER BY seq ASC")
            .fetch_all(&self.pool)
            .await
            .map_err(query_failed)?;

        rows.iter().map(row_to_turn).collect()
    }

    async fn append(&self, turn: ChatTurn) -> Result<(), StorageError> {
        sqlx::query("INSERT INTO chat_history (id, message, response, created_at) VALUES (?, ?, ?, ?)")
            .bind(&turn.id)
            .bind(&turn.message)
            .bind(&turn.response)
            .bind(turn.created_at.to_rfc3339())
            .execute(&self.pool)
            .await
            .map_err(query_failed)?;
        Ok(())
    }

    async fn clear(&self) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM chat_history")
            .execute(&self.pool)
            .await
            .map_err(query_failed)?;
        Ok(())
    }
}
