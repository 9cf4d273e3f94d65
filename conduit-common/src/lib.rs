//! Conduit Common - Shared types, utilities, and configuration for the Conduit engine.
//!
//! This crate provides:
//! - Configuration types and loading
//! - Configuration validation
//! - The unified error taxonomy surfaced to the tool-invocation layer
//! - Logging setup
//! - Small text and duration helpers

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod util;
pub mod validation;

pub use config::{
    Config, ConversationConfig, ObservabilityConfig, RedisStorageConfig, SessionsConfig,
    StorageBackendKind, StorageConfig, WorkspaceConfig,
};
pub use error::{Error, Result, ResultExt};
pub use validation::{Validate, ValidationError, ValidationResult};

/// Re-export commonly used types for convenience
pub mod prelude {
    pub use crate::config::{Config, ConversationConfig, SessionsConfig, StorageConfig};
    pub use crate::error::{Error, Result};
    pub use crate::logging::init_logging;
    pub use crate::validation::{Validate, ValidationError};
}
