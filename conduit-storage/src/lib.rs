//! Expiring key-value storage for Conduit.
//!
//! Conversation threads are persisted through the [`StorageBackend`] trait.
//! Two backends are provided:
//!
//! - **In-Memory**: bounded, process-local, lost on restart (default)
//! - **Redis**: external cache for multi-process deployments (`redis-backend` feature)
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │          Conversation Thread Store            │
//! └──────────────────────┬────────────────────────┘
//!                        │ set(key, value, ttl) / get(key)
//!             ┌──────────▼──────────┐
//!             │ StorageBackend Trait│
//!             └──────────┬──────────┘
//!            ┌───────────┴───────────┐
//!     ┌──────▼──────┐         ┌──────▼──────┐
//!     │  InMemory   │         │    Redis    │
//!     │  (bounded)  │         │  (SET PX)   │
//!     └─────────────┘         └─────────────┘
//! ```
//!
//! Reads never extend an entry's expiry; only a fresh `set` re-arms it.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub mod memory;
pub mod redis_store;

pub use memory::{InMemoryStorage, SweeperHandle};
pub use redis_store::RedisStorage;

use conduit_common::config::{StorageBackendKind, StorageConfig};

// ============================================================================
// Error Types
// ============================================================================

/// Storage errors.
#[derive(Error, Debug)]
pub enum StorageError {
    /// The bounded in-process store is full and nothing has expired.
    #[error("Storage capacity exceeded: {max_entries} entries")]
    CapacityExceeded { max_entries: usize },

    /// A TTL of zero, or one too large to represent as a deadline.
    #[error("Invalid TTL for key {key}: {reason}")]
    InvalidTtl { key: String, reason: &'static str },

    /// Connection error to the backend.
    #[error("Connection error: {0}")]
    Connection(String),

    /// Command or internal backend failure.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Backend not available (closed or never connected).
    #[error("Backend not available: {0}")]
    Unavailable(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

impl From<StorageError> for conduit_common::Error {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::CapacityExceeded { .. } => Self::Exhausted(err.to_string()),
            other => Self::Storage(other.to_string()),
        }
    }
}

// ============================================================================
// Storage Backend Trait
// ============================================================================

/// Expiring key-value store contract.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Store `value` under `key`, expiring after `ttl`. Overwrites re-arm the TTL.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StorageResult<()>;

    /// Fetch a value if present and unexpired. Does not extend the TTL.
    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>>;

    /// Remove a key. Returns whether a live entry was removed.
    async fn delete(&self, key: &str) -> StorageResult<bool>;

    /// Check if the backend is connected/healthy.
    async fn is_healthy(&self) -> bool;

    /// Release backend resources.
    async fn close(&self) -> StorageResult<()>;

    /// Short backend name for logs.
    fn name(&self) -> &'static str;
}

fn check_ttl(key: &str, ttl: Duration) -> StorageResult<()> {
    if ttl.is_zero() {
        return Err(StorageError::InvalidTtl {
            key: key.to_string(),
            reason: "must be greater than zero",
        });
    }
    Ok(())
}

// ============================================================================
// Storage Factory
// ============================================================================

/// A constructed backend plus the background sweeper it owns, if any.
pub struct StorageHandle {
    pub backend: Arc<dyn StorageBackend>,
    sweeper: Option<SweeperHandle>,
}

impl StorageHandle {
    /// Stop the sweeper (if running) and close the backend.
    pub async fn shutdown(self) -> StorageResult<()> {
        if let Some(sweeper) = self.sweeper {
            sweeper.stop().await;
        }
        self.backend.close().await
    }
}

fn memory_handle(config: &StorageConfig) -> StorageHandle {
    let storage = InMemoryStorage::with_max_entries(config.max_entries);
    let sweeper = (config.sweep_interval_secs > 0)
        .then(|| storage.spawn_sweeper(Duration::from_secs(config.sweep_interval_secs)));
    StorageHandle {
        backend: Arc::new(storage),
        sweeper,
    }
}

/// Create a storage backend from configuration.
///
/// Must be called inside a Tokio runtime when the in-memory sweeper is enabled.
#[cfg(feature = "redis-backend")]
pub async fn create_storage_async(config: &StorageConfig) -> StorageResult<StorageHandle> {
    match config.backend {
        StorageBackendKind::Memory => Ok(memory_handle(config)),
        StorageBackendKind::Redis => {
            let storage = RedisStorage::connect(config.redis.clone()).await?;
            tracing::info!(url = %config.redis.url, "Using Redis storage backend");
            Ok(StorageHandle {
                backend: Arc::new(storage),
                sweeper: None,
            })
        }
    }
}

/// Create a storage backend from configuration (Redis falls back to in-memory
/// when the `redis-backend` feature is not enabled).
#[cfg(not(feature = "redis-backend"))]
pub async fn create_storage_async(config: &StorageConfig) -> StorageResult<StorageHandle> {
    match config.backend {
        StorageBackendKind::Memory => Ok(memory_handle(config)),
        StorageBackendKind::Redis => {
            let storage = RedisStorage::new(config.redis.clone(), config.max_entries);
            Ok(StorageHandle {
                backend: Arc::new(storage),
                sweeper: None,
            })
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
