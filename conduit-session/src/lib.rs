//! Session registry for Conduit.
//!
//! A session binds a client-chosen id to a validated project root and the
//! per-session resources built for it. The registry is bounded, never evicts
//! a live session to make room, and is swept by a background reaper.
//!
//! ```text
//! get_or_create(id, root)
//!   ├─ registry lock: live hit? ──────────────► touch, return
//!   ├─ WorkspacePolicy::validate(root)          (no lock held)
//!   └─ registry lock: re-check, purge expired if full, insert
//! ```

use thiserror::Error;

pub mod file_context;
pub mod manager;
pub mod reaper;
pub mod session;
pub mod workspace;

pub use file_context::{EmbeddedFile, FileContext, FileContextError, FileContextProcessor};
pub use manager::SessionManager;
pub use reaper::{ReaperHandle, SessionReaper};
pub use session::{Session, SessionInfo};
pub use workspace::{WorkspaceError, WorkspacePolicy};

/// Session registry errors.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session id must not be empty")]
    InvalidId,

    #[error(transparent)]
    Validation(#[from] WorkspaceError),

    /// Registry full of live sessions. The caller should report "server busy".
    #[error("Session registry at capacity ({capacity}), no idle sessions to reclaim")]
    CapacityExhausted { capacity: usize },

    #[error("Session registry lock poisoned")]
    LockPoisoned,

    #[error("Failed to build resources for session {session_id}: {source}")]
    Resource {
        session_id: String,
        #[source]
        source: std::io::Error,
    },
}

/// Result type for session operations.
pub type SessionResult<T> = Result<T, SessionError>;

impl From<SessionError> for conduit_common::Error {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::InvalidId | SessionError::Validation(_) => {
                Self::Validation(err.to_string())
            }
            SessionError::CapacityExhausted { .. } => Self::Exhausted(err.to_string()),
            SessionError::LockPoisoned => Self::Invariant(err.to_string()),
            SessionError::Resource { source, .. } => Self::Io(source),
        }
    }
}
