//! Redis storage backend.
//!
//! Values are written with `SET key value PX ttl` so Redis owns expiry.
//! Without the `redis-backend` feature this type wraps the in-memory store.

use async_trait::async_trait;
use std::time::Duration;

use conduit_common::config::RedisStorageConfig;

#[cfg(not(feature = "redis-backend"))]
use crate::InMemoryStorage;
use crate::{check_ttl, StorageBackend, StorageResult};
#[cfg(feature = "redis-backend")]
use crate::StorageError;

/// Redis-backed expiring key-value store.
#[cfg(feature = "redis-backend")]
pub struct RedisStorage {
    config: RedisStorageConfig,
    /// Connection manager (reconnects automatically). `None` once closed.
    conn_manager: tokio::sync::RwLock<Option<redis::aio::ConnectionManager>>,
}

#[cfg(feature = "redis-backend")]
impl RedisStorage {
    /// Connect to Redis, failing if the server is not reachable within the
    /// configured timeout.
    pub async fn connect(config: RedisStorageConfig) -> StorageResult<Self> {
        let client = redis::Client::open(config.url.as_str())
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        let timeout = Duration::from_secs(config.timeout_secs.max(1));
        let conn_manager = tokio::time::timeout(timeout, client.get_connection_manager())
            .await
            .map_err(|_| {
                StorageError::Connection(format!(
                    "timed out after {}s connecting to {}",
                    timeout.as_secs(),
                    config.url
                ))
            })?
            .map_err(|e| StorageError::Connection(e.to_string()))?;

        Ok(Self {
            config,
            conn_manager: tokio::sync::RwLock::new(Some(conn_manager)),
        })
    }

    pub fn config(&self) -> &RedisStorageConfig {
        &self.config
    }

    fn prefixed_key(&self, key: &str) -> String {
        format!("{}{}", self.config.key_prefix, key)
    }

    /// Clone the managed connection out of the lock so commands do not
    /// serialize behind one another.
    async fn connection(&self) -> StorageResult<redis::aio::ConnectionManager> {
        self.conn_manager
            .read()
            .await
            .clone()
            .ok_or_else(|| StorageError::Unavailable("Redis connection closed".to_string()))
    }
}

#[cfg(feature = "redis-backend")]
#[async_trait]
impl StorageBackend for RedisStorage {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        check_ttl(key, ttl)?;
        let mut conn = self.connection().await?;
        let full_key = self.prefixed_key(key);
        // Sub-millisecond TTLs round up so the entry is still written with an expiry.
        let ttl_ms = u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1);

        redis::cmd("SET")
            .arg(&full_key)
            .arg(value)
            .arg("PX")
            .arg(ttl_ms)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;

        tracing::trace!(key = %full_key, ttl_ms, "Stored value in Redis");
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let mut conn = self.connection().await?;
        redis::cmd("GET")
            .arg(self.prefixed_key(key))
            .query_async::<Option<Vec<u8>>>(&mut conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let mut conn = self.connection().await?;
        let removed = redis::cmd("DEL")
            .arg(self.prefixed_key(key))
            .query_async::<i64>(&mut conn)
            .await
            .map_err(|e| StorageError::Backend(e.to_string()))?;
        Ok(removed > 0)
    }

    async fn is_healthy(&self) -> bool {
        let Ok(mut conn) = self.connection().await else {
            return false;
        };
        match redis::cmd("PING").query_async::<String>(&mut conn).await {
            Ok(response) => response == "PONG",
            Err(_) => false,
        }
    }

    async fn close(&self) -> StorageResult<()> {
        let mut conn = self.conn_manager.write().await;
        *conn = None;
        Ok(())
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

/// Placeholder for Redis storage when the feature is not enabled.
#[cfg(not(feature = "redis-backend"))]
pub struct RedisStorage {
    config: RedisStorageConfig,
    fallback: InMemoryStorage,
}

#[cfg(not(feature = "redis-backend"))]
impl RedisStorage {
    /// Create a Redis store (falls back to in-memory when feature not enabled).
    pub fn new(config: RedisStorageConfig, max_entries: usize) -> Self {
        tracing::warn!(
            url = %config.url,
            "Redis backend feature not enabled. Falling back to in-memory storage. \
             Enable with: cargo build --features redis-backend"
        );
        Self {
            config,
            fallback: InMemoryStorage::with_max_entries(max_entries),
        }
    }

    pub fn config(&self) -> &RedisStorageConfig {
        &self.config
    }
}

#[cfg(not(feature = "redis-backend"))]
#[async_trait]
impl StorageBackend for RedisStorage {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        check_ttl(key, ttl)?;
        self.fallback.set(key, value, ttl).await
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        self.fallback.get(key).await
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        self.fallback.delete(key).await
    }

    async fn is_healthy(&self) -> bool {
        self.fallback.is_healthy().await
    }

    async fn close(&self) -> StorageResult<()> {
        self.fallback.close().await
    }

    fn name(&self) -> &'static str {
        "redis-fallback"
    }
}
