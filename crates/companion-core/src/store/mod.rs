// Chat log persistence: one append-only record per exchange, per user.

pub mod sqlite;

#[cfg(feature = "redis")]
pub mod redis;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::StorageConfig;

pub use sqlite::SqliteStore;

/// Which backend a store writes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Redis,
    Sqlite,
}

impl fmt::Display for StoreBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreBackend::Redis => f.write_str("redis"),
            StoreBackend::Sqlite => f.write_str("sqlite"),
        }
    }
}

/// A single persisted exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRecord {
    pub user_id: String,
    pub user_message: String,
    pub reply: String,
    pub timestamp: DateTime<Utc>,
}

impl ChatRecord {
    /// Build a record stamped with the current time.
    pub fn now(
        user_id: impl Into<String>,
        user_message: impl Into<String>,
        reply: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            user_message: user_message.into(),
            reply: reply.into(),
            timestamp: Utc::now(),
        }
    }
}

/// The (user message, reply) pair read back from history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatTurn {
    pub user_message: String,
    pub reply: String,
}

impl ChatTurn {
    pub fn new(user_message: impl Into<String>, reply: impl Into<String>) -> Self {
        Self {
            user_message: user_message.into(),
            reply: reply.into(),
        }
    }
}

#[async_trait]
pub trait ChatStore: Send + Sync {
    fn backend(&self) -> StoreBackend;

    /// Append one record. Records are never updated in place.
    async fn append(&self, record: &ChatRecord) -> Result<()>;

    /// The most recent `n` turns for `user_id`, oldest first.
    async fn latest(&self, user_id: &str, n: usize) -> Result<Vec<ChatTurn>>;

    /// Total number of records stored for `user_id`.
    async fn count(&self, user_id: &str) -> Result<usize>;
}

/// Open the configured chat store, falling back to SQLite when the primary
/// backend cannot be reached.
pub async fn connect_store(config: &StorageConfig) -> Result<Arc<dyn ChatStore>> {
    if config.primary == StoreBackend::Redis {
        let timeout = Duration::from_millis(config.redis_timeout_ms);
        match connect_redis(config.redis_url.as_deref(), timeout).await {
            Ok(store) => {
                info!("chat store: redis");
                return Ok(store);
            }
            Err(e) => {
                warn!(error = %e, "redis unavailable, falling back to sqlite");
            }
        }
    }

    let store = SqliteStore::open(&config.sqlite_path)?;
    info!(path = %config.sqlite_path, "chat store: sqlite");
    Ok(Arc::new(store))
}

#[cfg(feature = "redis")]
async fn connect_redis(url: Option<&str>, timeout: Duration) -> Result<Arc<dyn ChatStore>> {
    let url = url.ok_or_else(|| anyhow::anyhow!("storage.redis_url is not set"))?;
    let store = redis::RedisStore::connect(url, timeout).await?;
    Ok(Arc::new(store))
}

#[cfg(not(feature = "redis"))]
async fn connect_redis(_url: Option<&str>, _timeout: Duration) -> Result<Arc<dyn ChatStore>> {
    anyhow::bail!("built without the `redis` feature")
}
