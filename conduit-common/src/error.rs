//! Error types for the Conduit engine.
//!
//! Each subsystem crate keeps its own precise error enum and converts into
//! [`Error`] at the boundary to the tool-invocation layer. The variants follow
//! the engine's error taxonomy: validation failures and resource exhaustion
//! are fatal to the triggering request, not-found is an expected outcome, and
//! invariant violations abort loudly.

use thiserror::Error;

/// Result type alias using the Conduit error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for Conduit.
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid or out-of-bounds input (e.g. a project root outside the allow-list)
    #[error("Validation error: {0}")]
    Validation(String),

    /// Capacity reached with nothing reclaimable
    #[error("Resource exhausted: {0}")]
    Exhausted(String),

    /// Unknown or expired session / continuation
    #[error("Not found: {0}")]
    NotFound(String),

    /// Internal invariant violated; indicates a locking bug elsewhere
    #[error("Invariant violation: {0}")]
    Invariant(String),

    /// Storage backend failure
    #[error("Storage error: {0}")]
    Storage(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Timeout error
    #[error("Operation timed out")]
    Timeout,

    /// Other error with context
    #[error("{context}: {source}")]
    WithContext {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Create an error with additional context.
    pub fn with_context(self, context: impl Into<String>) -> Self {
        Self::WithContext {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Whether this outcome is a normal, expected one (the caller decides
    /// whether to start fresh) rather than a fault.
    pub fn is_expected(&self) -> bool {
        match self {
            Self::NotFound(_) => true,
            Self::WithContext { source, .. } => source.is_expected(),
            _ => false,
        }
    }

    /// Check if this is a resource-exhaustion ("server busy") error.
    pub fn is_exhausted(&self) -> bool {
        match self {
            Self::Exhausted(_) => true,
            Self::WithContext { source, .. } => source.is_exhausted(),
            _ => false,
        }
    }

    /// Get HTTP status code for this error.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Validation(_) => 400,
            Self::NotFound(_) => 404,
            Self::Timeout => 408,
            Self::Exhausted(_) => 503,
            Self::WithContext { source, .. } => source.status_code(),
            _ => 500,
        }
    }
}

/// Extension trait for adding context to any error type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T>;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.into().with_context(context))
    }
}
