//! Bounded in-process storage backend.
//!
//! A single mutex guards the map. Expiry is checked lazily on every access;
//! an optional sweeper task purges expired entries in the background so that
//! keys nobody reads again still release their memory.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::{check_ttl, StorageBackend, StorageError, StorageResult};

/// Default entry ceiling.
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

#[derive(Debug, Clone)]
struct Entry {
    value: Vec<u8>,
    expires_at: Instant,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// In-memory storage for single-process deployments and tests.
#[derive(Debug, Clone)]
pub struct InMemoryStorage {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    max_entries: usize,
}

impl InMemoryStorage {
    /// Create a new store with the default entry ceiling.
    pub fn new() -> Self {
        Self::with_max_entries(DEFAULT_MAX_ENTRIES)
    }

    /// Create a new store holding at most `max_entries` live keys.
    pub fn with_max_entries(max_entries: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            max_entries: max_entries.max(1),
        }
    }

    pub fn max_entries(&self) -> usize {
        self.max_entries
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries
            .lock()
            .map_err(|_| StorageError::Backend("in-memory storage mutex poisoned".to_string()))
    }

    /// Number of entries currently held, including expired ones not yet purged.
    ///
    /// Reads through a poisoned lock rather than reporting an empty store.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned: PoisonError<_>| {
                tracing::error!("In-memory storage mutex poisoned, reading through it");
                poisoned.into_inner()
            })
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every expired entry. Returns the number purged.
    pub fn purge_expired(&self) -> StorageResult<usize> {
        let mut entries = self.lock()?;
        Ok(purge_locked(&mut entries, Instant::now()))
    }

    /// Start a background task that purges expired entries every `interval`.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn spawn_sweeper(&self, interval: Duration) -> SweeperHandle {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);
        let storage = self.clone();

        let handle = tokio::spawn(async move {
            tracing::debug!(interval_secs = interval.as_secs(), "Storage sweeper started");
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                match storage.purge_expired() {
                    Ok(0) => {}
                    Ok(purged) => tracing::debug!(purged, "Purged expired storage entries"),
                    Err(e) => tracing::error!(error = %e, "Storage sweep failed"),
                }
            }
            tracing::debug!("Storage sweeper stopped");
        });

        SweeperHandle { shutdown_tx, handle }
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

fn purge_locked(entries: &mut HashMap<String, Entry>, now: Instant) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| entry.is_live(now));
    before - entries.len()
}

#[async_trait]
impl StorageBackend for InMemoryStorage {
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> StorageResult<()> {
        check_ttl(key, ttl)?;
        let now = Instant::now();
        let expires_at = now.checked_add(ttl).ok_or_else(|| StorageError::InvalidTtl {
            key: key.to_string(),
            reason: "deadline overflows the clock",
        })?;
        let mut entries = self.lock()?;

        if !entries.contains_key(key) && entries.len() >= self.max_entries {
            let purged = purge_locked(&mut entries, now);
            if entries.len() >= self.max_entries {
                tracing::warn!(
                    key = %key,
                    max_entries = self.max_entries,
                    "In-memory storage full, refusing new key"
                );
                return Err(StorageError::CapacityExceeded {
                    max_entries: self.max_entries,
                });
            }
            tracing::debug!(purged, "Purged expired entries to make room");
        }

        entries.insert(
            key.to_string(),
            Entry { value, expires_at },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> StorageResult<Option<Vec<u8>>> {
        let now = Instant::now();
        let mut entries = self.lock()?;

        match entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> StorageResult<bool> {
        let now = Instant::now();
        let mut entries = self.lock()?;
        Ok(entries.remove(key).is_some_and(|entry| entry.is_live(now)))
    }

    async fn is_healthy(&self) -> bool {
        self.lock().is_ok()
    }

    async fn close(&self) -> StorageResult<()> {
        self.lock()?.clear();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

// ============================================================================
// Sweeper
// ============================================================================

/// Handle to a running storage sweeper.
pub struct SweeperHandle {
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper and wait for it to finish its current pass.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Storage sweeper task failed");
        }
    }
}
