//! A single client session bound to a validated project root.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::OnceCell;
use tokio::time::Instant;

use crate::file_context::{FileContextProcessor, DEFAULT_MAX_FILE_BYTES};
use crate::{SessionError, SessionResult};

/// Session state. Only the registry constructs sessions, and only after the
/// project root has passed workspace validation.
#[derive(Debug)]
pub struct Session {
    id: String,
    project_root: PathBuf,
    created_at: Instant,
    created_wall: DateTime<Utc>,
    last_activity: Mutex<Instant>,
    file_context: OnceCell<Arc<FileContextProcessor>>,
}

/// Point-in-time view of a session for diagnostics.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub project_root: PathBuf,
    pub created_at: DateTime<Utc>,
    pub idle_secs: u64,
    pub file_context_built: bool,
}

impl Session {
    pub(crate) fn new(id: String, project_root: PathBuf) -> Self {
        let now = Instant::now();
        Self {
            id,
            project_root,
            created_at: now,
            created_wall: Utc::now(),
            last_activity: Mutex::new(now),
            file_context: OnceCell::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Canonical project root. Never changes after construction.
    pub fn project_root(&self) -> &Path {
        &self.project_root
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn created_wall(&self) -> DateTime<Utc> {
        self.created_wall
    }

    pub fn last_activity(&self) -> Instant {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record activity. The timestamp never moves backwards.
    pub fn touch(&self) {
        let now = Instant::now();
        let mut last = self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if now > *last {
            *last = now;
        }
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_activity())
    }

    pub fn is_expired(&self, now: Instant, idle_timeout: Duration) -> bool {
        self.idle_for(now) > idle_timeout
    }

    /// The session's file context processor, built on first use.
    ///
    /// Concurrent first callers wait on this session's slot only; the registry
    /// lock is never involved.
    pub async fn file_context(&self) -> SessionResult<Arc<FileContextProcessor>> {
        self.touch();
        let processor = self
            .file_context
            .get_or_try_init(|| async {
                FileContextProcessor::build(self.project_root.clone(), DEFAULT_MAX_FILE_BYTES)
                    .await
                    .map(Arc::new)
                    .map_err(|source| SessionError::Resource {
                        session_id: self.id.clone(),
                        source,
                    })
            })
            .await?;
        Ok(Arc::clone(processor))
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.id.clone(),
            project_root: self.project_root.clone(),
            created_at: self.created_wall,
            idle_secs: self.idle_for(Instant::now()).as_secs(),
            file_context_built: self.file_context.initialized(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_touch_is_monotonic() {
        let session = Session::new("s1".into(), PathBuf::from("/tmp"));
        let first = session.last_activity();

        tokio::time::advance(Duration::from_secs(5)).await;
        session.touch();
        let second = session.last_activity();
        assert!(second > first);
        assert_eq!(session.created_at(), first);

        session.touch();
        assert!(session.last_activity() >= second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expiry() {
        let session = Session::new("s1".into(), PathBuf::from("/tmp"));
        let timeout = Duration::from_secs(60);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert!(!session.is_expired(Instant::now(), timeout));

        tokio::time::advance(Duration::from_secs(1)).await;
        assert!(session.is_expired(Instant::now(), timeout));
    }

    #[tokio::test]
    async fn test_file_context_built_once() {
        let dir = tempfile::tempdir().unwrap();
        let root = std::fs::canonicalize(dir.path()).unwrap();
        let session = Arc::new(Session::new("s1".into(), root.clone()));
        assert!(!session.info().file_context_built);

        let mut tasks = Vec::new();
        for _ in 0..8 {
            let session = Arc::clone(&session);
            tasks.push(tokio::spawn(async move { session.file_context().await }));
        }
        let mut built = Vec::new();
        for task in tasks {
            built.push(task.await.unwrap().unwrap());
        }

        assert!(built.iter().all(|p| Arc::ptr_eq(p, &built[0])));
        assert_eq!(built[0].root(), root.as_path());
        assert!(session.info().file_context_built);
    }

    #[tokio::test]
    async fn test_file_context_fails_when_root_removed() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join("gone");
        std::fs::create_dir(&root).unwrap();
        let session = Session::new("s1".into(), root.clone());
        std::fs::remove_dir(&root).unwrap();

        let err = session.file_context().await.unwrap_err();
        assert!(matches!(err, SessionError::Resource { .. }));
    }
}
