//! Durable key-value persistence for the offline engine
//!
//! Every service persists its state under a fixed string key:
//! - `offline_data` / `offline_versions` - Offline Store records and version metadata
//! - `task_queue` / `dead_letter_tasks` - pending and exhausted write tasks
//! - `conflict_queue` - unresolved conflicts
//! - `cache:{tag}` - per-tag response maps
//! - `scheduler_config` - background scheduler settings
//!
//! Values are JSON documents. A value that no longer parses is logged and
//! treated as empty, so one corrupted key never takes the engine down.

pub mod memory;

pub use memory::MemoryStore;

use rusqlite::params;
use serde::{de::DeserializeOwned, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

pub const OFFLINE_DATA_KEY: &str = "offline_data";
pub const OFFLINE_VERSIONS_KEY: &str = "offline_versions";
pub const TASK_QUEUE_KEY: &str = "task_queue";
pub const DEAD_LETTER_KEY: &str = "dead_letter_tasks";
pub const CONFLICT_QUEUE_KEY: &str = "conflict_queue";
pub const SCHEDULER_CONFIG_KEY: &str = "scheduler_config";
pub const CACHE_KEY_PREFIX: &str = "cache:";

/// Storage key holding the response map for one cache tag
pub fn cache_key(tag: &str) -> String {
    format!("{}{}", CACHE_KEY_PREFIX, tag)
}

/// Escape LIKE wildcards so prefixes match literally
fn escape_like_pattern(query: &str) -> String {
    query
        .replace('\\', "\\\\")
        .replace('%', "\\%")
        .replace('_', "\\_")
}

/// Storage error types
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Storage unavailable: {0}")]
    Unavailable(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type StorageResult<T> = Result<T, StorageError>;

/// Durable string-keyed store
///
/// Implementations must be cheap to call from async code; values are small
/// JSON documents (tens to hundreds of records).
pub trait KeyValueStore: Send + Sync {
    fn load(&self, key: &str) -> StorageResult<Option<String>>;
    fn save(&self, key: &str, value: &str) -> StorageResult<()>;
    fn remove(&self, key: &str) -> StorageResult<()>;
    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>>;
}

/// Shared handle to a storage backend
pub type SharedStore = Arc<dyn KeyValueStore>;

/// Read and deserialize a JSON value
pub fn read_json<T: DeserializeOwned>(store: &dyn KeyValueStore, key: &str) -> StorageResult<Option<T>> {
    match store.load(key)? {
        Some(json) => {
            let value = serde_json::from_str(&json)
                .map_err(|e| StorageError::Serialization(e.to_string()))?;
            Ok(Some(value))
        }
        None => Ok(None),
    }
}

/// Serialize and write a JSON value
pub fn write_json<T: Serialize>(store: &dyn KeyValueStore, key: &str, value: &T) -> StorageResult<()> {
    let json = serde_json::to_string(value)
        .map_err(|e| StorageError::Serialization(e.to_string()))?;
    store.save(key, &json)
}

/// Load a JSON value, falling back to `T::default()` when the key is
/// missing, unreadable or corrupted
pub fn read_json_or_default<T: DeserializeOwned + Default>(store: &dyn KeyValueStore, key: &str) -> T {
    match read_json(store, key) {
        Ok(Some(value)) => value,
        Ok(None) => T::default(),
        Err(e) => {
            log::warn!("Discarding unreadable value under '{}': {}", key, e);
            T::default()
        }
    }
}

// ============================================================================
// SQLite backend
// ============================================================================

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS kv_store (
    key TEXT PRIMARY KEY NOT NULL,
    value TEXT NOT NULL
);
"#;

/// SQLite-backed key-value store
/// Uses r2d2 connection pooling for file databases
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Open (or create) a database file
    pub fn new(db_path: PathBuf) -> StorageResult<Self> {
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Unavailable(e.to_string()))?;
            }
        }

        let manager = SqliteConnectionManager::file(&db_path);

        let pool = Pool::builder()
            .max_size(8)
            .min_idle(Some(1))
            .connection_timeout(std::time::Duration::from_secs(10))
            .build(manager)?;

        let conn = pool.get()?;

        conn.execute_batch(r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#)?;

        conn.execute_batch(SCHEMA)?;
        drop(conn);

        log::info!("Opened offline database at {}", db_path.display());

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for testing)
    ///
    /// Every SQLite `:memory:` connection is its own database, so the pool is
    /// pinned to a single connection.
    pub fn in_memory() -> StorageResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder()
            .max_size(1)
            .build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(SCHEMA)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Get a connection from the pool
    #[inline]
    pub fn get_conn(&self) -> StorageResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }
}

impl KeyValueStore for Database {
    fn load(&self, key: &str) -> StorageResult<Option<String>> {
        let conn = self.get_conn()?;
        let result: Result<String, _> = conn.query_row(
            "SELECT value FROM kv_store WHERE key = ?1",
            [key],
            |row| row.get(0),
        );

        match result {
            Ok(json) => Ok(Some(json)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, key: &str, value: &str) -> StorageResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv_store (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        let conn = self.get_conn()?;
        conn.execute("DELETE FROM kv_store WHERE key = ?1", [key])?;
        Ok(())
    }

    fn keys_with_prefix(&self, prefix: &str) -> StorageResult<Vec<String>> {
        let conn = self.get_conn()?;
        let pattern = format!("{}%", escape_like_pattern(prefix));
        let mut stmt = conn.prepare(
            "SELECT key FROM kv_store WHERE key LIKE ?1 ESCAPE '\\' ORDER BY key",
        )?;
        let rows = stmt.query_map([pattern], |row| row.get::<_, String>(0))?;

        rows.collect::<rusqlite::Result<Vec<String>>>()
            .map_err(StorageError::from)
    }
}

// ============================================================================
// Tests
// ============================================================================
