//! Configuration validation.
//!
//! Every section is checked independently; all failures are collected so an
//! operator sees the full list at startup.

use thiserror::Error;

use crate::config::{
    Config, ConversationConfig, ObservabilityConfig, SessionsConfig, StorageBackendKind,
    StorageConfig, WorkspaceConfig,
};

/// Configuration validation error.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Missing required field: {field}")]
    MissingField { field: String },

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("Multiple validation errors: {0:?}")]
    Multiple(Vec<ValidationError>),
}

/// Result type for validation operations.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Trait for validatable configuration sections.
pub trait Validate {
    /// Validate this configuration section.
    fn validate(&self) -> ValidationResult<()>;
}

/// Longest conversation TTL accepted (one year).
pub const MAX_CONVERSATION_TTL_HOURS: u64 = 24 * 365;

/// A thread must hold at least one agent turn and its tool response.
pub const MIN_MAX_TURNS: usize = 2;

fn positive(field: &str, value: u64) -> ValidationResult<()> {
    if value == 0 {
        return Err(ValidationError::InvalidValue {
            field: field.into(),
            reason: "must be greater than 0".into(),
        });
    }
    Ok(())
}

impl Validate for Config {
    fn validate(&self) -> ValidationResult<()> {
        let mut errors: Vec<ValidationError> = [
            self.sessions.validate(),
            self.workspace.validate(),
            self.conversation.validate(),
            self.storage.validate(),
            self.observability.validate(),
        ]
        .into_iter()
        .filter_map(Result::err)
        .collect();

        if errors.is_empty() {
            Ok(())
        } else if errors.len() == 1 {
            Err(errors.remove(0))
        } else {
            Err(ValidationError::Multiple(errors))
        }
    }
}

impl Config {
    /// Load, apply env overrides, and validate.
    pub fn load_and_validate() -> anyhow::Result<Self> {
        let config = Self::load_with_env()?;
        config.validate().map_err(|e| anyhow::anyhow!("{}", e))?;
        Ok(config)
    }
}

impl Validate for SessionsConfig {
    fn validate(&self) -> ValidationResult<()> {
        positive("sessions.capacity", self.capacity as u64)?;
        positive("sessions.idle_timeout_secs", self.idle_timeout_secs)?;
        positive("sessions.reaper_interval_secs", self.reaper_interval_secs)?;
        positive("sessions.canonicalize_timeout_ms", self.canonicalize_timeout_ms)
    }
}

impl Validate for WorkspaceConfig {
    fn validate(&self) -> ValidationResult<()> {
        for root in self.expanded_roots() {
            if !root.is_absolute() {
                return Err(ValidationError::InvalidValue {
                    field: "workspace.allowed_roots".into(),
                    reason: format!("{} is not an absolute path", root.display()),
                });
            }
        }
        Ok(())
    }
}

impl Validate for ConversationConfig {
    fn validate(&self) -> ValidationResult<()> {
        positive("conversation.ttl_hours", self.ttl_hours)?;
        if self.ttl_hours > MAX_CONVERSATION_TTL_HOURS {
            return Err(ValidationError::InvalidValue {
                field: "conversation.ttl_hours".into(),
                reason: format!("must be at most {MAX_CONVERSATION_TTL_HOURS}"),
            });
        }
        if self.max_turns < MIN_MAX_TURNS {
            return Err(ValidationError::InvalidValue {
                field: "conversation.max_turns".into(),
                reason: format!("must be at least {MIN_MAX_TURNS}"),
            });
        }
        positive("conversation.history_token_budget", self.history_token_budget as u64)
    }
}

impl Validate for StorageConfig {
    fn validate(&self) -> ValidationResult<()> {
        positive("storage.max_entries", self.max_entries as u64)?;

        if self.backend == StorageBackendKind::Redis {
            if self.redis.url.trim().is_empty() {
                return Err(ValidationError::MissingField {
                    field: "storage.redis.url".into(),
                });
            }
            if !self.redis.url.starts_with("redis://") && !self.redis.url.starts_with("rediss://") {
                return Err(ValidationError::InvalidValue {
                    field: "storage.redis.url".into(),
                    reason: "must start with redis:// or rediss://".into(),
                });
            }
        }

        Ok(())
    }
}

impl Validate for ObservabilityConfig {
    fn validate(&self) -> ValidationResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.log_level.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_level".into(),
                reason: format!("must be one of: {}", valid_levels.join(", ")),
            });
        }

        let valid_formats = ["json", "pretty"];
        if !valid_formats.contains(&self.log_format.to_lowercase().as_str()) {
            return Err(ValidationError::InvalidValue {
                field: "observability.log_format".into(),
                reason: format!("must be one of: {}", valid_formats.join(", ")),
            });
        }

        Ok(())
    }
}
