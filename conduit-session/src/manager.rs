//! Bounded session registry.
//!
//! One mutex guards the registry and is never held across an `.await`.
//! Project roots are validated between two critical sections: a fast lookup,
//! then a re-check and insert. Whoever inserts first wins and every other
//! creator for the same id receives that instance.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use lru::LruCache;
use tokio::time::Instant;

use conduit_common::config::Config;

use crate::session::Session;
use crate::workspace::WorkspacePolicy;
use crate::{SessionError, SessionResult};

type Registry = LruCache<String, Arc<Session>>;

pub struct SessionManager {
    sessions: Mutex<Registry>,
    capacity: usize,
    idle_timeout: Duration,
    policy: WorkspacePolicy,
}

impl SessionManager {
    pub fn new(policy: WorkspacePolicy, capacity: usize, idle_timeout: Duration) -> Self {
        Self {
            sessions: Mutex::new(LruCache::unbounded()),
            capacity: capacity.max(1),
            idle_timeout,
            policy,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            WorkspacePolicy::from_config(&config.workspace, &config.sessions),
            config.sessions.capacity,
            config.sessions.idle_timeout(),
        )
    }

    fn lock(&self) -> SessionResult<MutexGuard<'_, Registry>> {
        self.sessions.lock().map_err(|_| SessionError::LockPoisoned)
    }

    /// Read-only view that survives a poisoned lock. A panic while holding
    /// the lock cannot leave the map half-updated, so counts stay accurate.
    fn snapshot(&self) -> MutexGuard<'_, Registry> {
        self.sessions.lock().unwrap_or_else(|poisoned: PoisonError<_>| {
            tracing::error!("Session registry lock poisoned, reading through it");
            poisoned.into_inner()
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    pub fn policy(&self) -> &WorkspacePolicy {
        &self.policy
    }

    /// Return the live session for `session_id`, creating it for `project_root`
    /// when absent or expired.
    ///
    /// A live session is returned as-is even if `project_root` differs from
    /// the root it was created with.
    pub async fn get_or_create(
        &self,
        session_id: &str,
        project_root: &str,
    ) -> SessionResult<Arc<Session>> {
        if session_id.trim().is_empty() {
            return Err(SessionError::InvalidId);
        }

        if let Some(session) = self.live(session_id)? {
            tracing::debug!(session_id = %session_id, "Session hit");
            return Ok(session);
        }

        let canonical = match self.policy.validate(project_root).await {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(
                    session_id = %session_id,
                    project_root = %project_root,
                    error = %e,
                    "Rejected project root"
                );
                return Err(e.into());
            }
        };

        let mut sessions = self.lock()?;
        let now = Instant::now();

        let existing = sessions.get(session_id).cloned();
        if let Some(existing) = existing {
            if !existing.is_expired(now, self.idle_timeout) {
                existing.touch();
                tracing::debug!(session_id = %session_id, "Session created concurrently, reusing");
                return Ok(existing);
            }
            sessions.pop(session_id);
            tracing::info!(session_id = %session_id, "Replacing expired session");
        }

        if sessions.len() >= self.capacity {
            let purged = purge_expired(&mut sessions, now, self.idle_timeout);
            if sessions.len() >= self.capacity {
                tracing::warn!(
                    session_id = %session_id,
                    capacity = self.capacity,
                    "Session registry full"
                );
                return Err(SessionError::CapacityExhausted {
                    capacity: self.capacity,
                });
            }
            tracing::info!(purged, "Purged expired sessions to make room");
        }

        let session = Arc::new(Session::new(session_id.to_string(), canonical));
        sessions.put(session_id.to_string(), Arc::clone(&session));
        tracing::info!(
            session_id = %session_id,
            project_root = %session.project_root().display(),
            active = sessions.len(),
            "Session created"
        );
        Ok(session)
    }

    /// Live lookup: touches and promotes on hit, drops an expired entry.
    fn live(&self, session_id: &str) -> SessionResult<Option<Arc<Session>>> {
        let mut sessions = self.lock()?;
        let Some(session) = sessions.get(session_id).cloned() else {
            return Ok(None);
        };
        if session.is_expired(Instant::now(), self.idle_timeout) {
            sessions.pop(session_id);
            tracing::debug!(session_id = %session_id, "Dropped expired session on lookup");
            return Ok(None);
        }
        session.touch();
        Ok(Some(session))
    }

    /// Look up a session without creating one.
    pub fn get(&self, session_id: &str) -> SessionResult<Option<Arc<Session>>> {
        self.live(session_id)
    }

    /// Remove a session. Returns whether it was present.
    pub fn remove(&self, session_id: &str) -> SessionResult<bool> {
        let removed = self.lock()?.pop(session_id).is_some();
        if removed {
            tracing::info!(session_id = %session_id, "Session removed");
        }
        Ok(removed)
    }

    /// Remove every session idle longer than the configured timeout.
    pub fn cleanup_expired(&self) -> SessionResult<usize> {
        self.cleanup_expired_with(self.idle_timeout)
    }

    /// Remove every session idle longer than `idle_timeout`.
    pub fn cleanup_expired_with(&self, idle_timeout: Duration) -> SessionResult<usize> {
        let mut sessions = self.lock()?;
        let removed = purge_expired(&mut sessions, Instant::now(), idle_timeout);
        if removed > 0 {
            tracing::info!(removed, remaining = sessions.len(), "Expired sessions cleaned up");
        }
        Ok(removed)
    }

    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Session ids, most recently used first.
    pub fn ids(&self) -> Vec<String> {
        self.snapshot().iter().map(|(id, _)| id.clone()).collect()
    }
}

/// Snapshot expired ids, then remove them.
fn purge_expired(sessions: &mut Registry, now: Instant, idle_timeout: Duration) -> usize {
    let expired: Vec<String> = sessions
        .iter()
        .filter(|(_, session)| session.is_expired(now, idle_timeout))
        .map(|(id, _)| id.clone())
        .collect();

    for id in &expired {
        sessions.pop(id);
        tracing::debug!(session_id = %id, "Expired session removed");
    }
    expired.len()
}
