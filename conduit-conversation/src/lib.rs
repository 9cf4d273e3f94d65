//! Conversation threads for Conduit.
//!
//! A thread is an append-only list of turns addressed by a UUID that clients
//! carry between otherwise independent tool calls as their continuation id.
//! Threads live in a [`conduit_storage::StorageBackend`] with a sliding TTL
//! that only successful appends re-arm.
//!
//! [`context`] rebuilds prior context for a continued conversation: files are
//! deduplicated newest-first for inclusion while the rendered history keeps
//! strict chronological turn order.

use thiserror::Error;

use conduit_storage::StorageError;

pub mod context;
pub mod store;
pub mod types;

pub use context::{
    build_history, collect_file_references, collect_image_references, ConversationHistory,
    FileReference,
};
pub use store::ThreadStore;
pub use types::{ConversationThread, Turn, TurnRole};

/// Conversation store errors.
#[derive(Error, Debug)]
pub enum ConversationError {
    /// Unknown, expired or malformed continuation id. An expected outcome
    /// whenever a client resumes a stale conversation.
    #[error("Conversation thread not found or expired: {thread_id}")]
    ThreadNotFound { thread_id: String },

    /// The thread already holds the maximum number of turns.
    #[error("Conversation thread {thread_id} reached the {max_turns} turn limit")]
    TurnLimitReached { thread_id: String, max_turns: usize },

    /// Stored state contradicts an invariant the store maintains.
    #[error("Conversation invariant violated: {0}")]
    InvariantViolation(String),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error("Failed to (de)serialize thread: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for conversation operations.
pub type ConversationResult<T> = Result<T, ConversationError>;

impl ConversationError {
    /// Whether this is the normal "thread is gone" outcome.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::ThreadNotFound { .. })
    }
}

impl From<ConversationError> for conduit_common::Error {
    fn from(err: ConversationError) -> Self {
        match err {
            ConversationError::ThreadNotFound { .. } => Self::NotFound(err.to_string()),
            ConversationError::TurnLimitReached { .. } => Self::Exhausted(err.to_string()),
            ConversationError::InvariantViolation(msg) => Self::Invariant(msg),
            ConversationError::Storage(e) => e.into(),
            ConversationError::Serialization(e) => Self::Json(e),
        }
    }
}
