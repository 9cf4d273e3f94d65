//! Configuration management for Conduit.
//!
//! The engine reads a single configuration file at `~/.conduit/config.json`.
//! Every field has a default, so a missing file yields a working in-process
//! setup (with an empty workspace allow-list, which rejects all sessions).
//!
//! # Configuration Priority
//!
//! 1. Environment variables (CONDUIT_* prefix)
//! 2. Explicit config file values
//! 3. Default values
//!
//! # Environment Variable Mapping
//!
//! - `CONDUIT_SESSION_CAPACITY` → sessions.capacity
//! - `CONDUIT_SESSION_IDLE_TIMEOUT` → sessions.idle_timeout_secs (accepts `90`, `30m`, `1h`)
//! - `CONDUIT_REAPER_INTERVAL` → sessions.reaper_interval_secs (same format)
//! - `CONDUIT_ALLOWED_WORKSPACES` → workspace.allowed_roots (comma or colon separated)
//! - `CONDUIT_CONVERSATION_TTL_HOURS` / `CONVERSATION_TIMEOUT_HOURS` → conversation.ttl_hours
//! - `CONDUIT_MAX_TURNS` / `MAX_CONVERSATION_TURNS` → conversation.max_turns
//! - `CONDUIT_STORAGE_BACKEND` → storage.backend (`memory` or `redis`)
//! - `CONDUIT_REDIS_URL` → storage.redis.url
//! - `CONDUIT_LOG_LEVEL` → observability.log_level

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::util::parse_duration_secs;

/// Get the configuration directory path.
pub fn config_dir() -> PathBuf {
    directories::UserDirs::new().map_or_else(
        || PathBuf::from(".conduit"),
        |dirs| dirs.home_dir().join(".conduit"),
    )
}

/// Get the configuration file path.
pub fn config_path() -> PathBuf {
    config_dir().join("config.json")
}

// ============================================================================
// Session Registry Configuration
// ============================================================================

/// Session registry and reaper configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionsConfig {
    /// Maximum number of live sessions.
    #[serde(default = "default_session_capacity")]
    pub capacity: usize,

    /// Idle time after which a session is considered expired.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,

    /// How often the background reaper sweeps expired sessions.
    #[serde(default = "default_reaper_interval_secs")]
    pub reaper_interval_secs: u64,

    /// Upper bound on project-root canonicalization (slow network mounts).
    #[serde(default = "default_canonicalize_timeout_ms")]
    pub canonicalize_timeout_ms: u64,
}

impl Default for SessionsConfig {
    fn default() -> Self {
        Self {
            capacity: default_session_capacity(),
            idle_timeout_secs: default_idle_timeout_secs(),
            reaper_interval_secs: default_reaper_interval_secs(),
            canonicalize_timeout_ms: default_canonicalize_timeout_ms(),
        }
    }
}

impl SessionsConfig {
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn reaper_interval(&self) -> Duration {
        Duration::from_secs(self.reaper_interval_secs)
    }

    pub fn canonicalize_timeout(&self) -> Duration {
        Duration::from_millis(self.canonicalize_timeout_ms)
    }
}

// ============================================================================
// Workspace Allow-list
// ============================================================================

/// Workspace roots a session's project root must fall within.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct WorkspaceConfig {
    /// Permitted workspace roots. `~` is expanded. Empty rejects every root.
    #[serde(default)]
    pub allowed_roots: Vec<String>,
}

impl WorkspaceConfig {
    /// Allow-list entries with `~` expanded.
    pub fn expanded_roots(&self) -> Vec<PathBuf> {
        self.allowed_roots
            .iter()
            .map(|root| PathBuf::from(shellexpand::tilde(root).as_ref()))
            .collect()
    }
}

// ============================================================================
// Conversation Configuration
// ============================================================================

/// Conversation thread expiry and history limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationConfig {
    /// Sliding TTL of a thread, re-armed on every appended turn.
    #[serde(default = "default_conversation_ttl_hours")]
    pub ttl_hours: u64,

    /// Hard ceiling on turns per thread.
    #[serde(default = "default_max_turns")]
    pub max_turns: usize,

    /// Maximum number of parent links followed when rebuilding a chain.
    #[serde(default = "default_max_chain_depth")]
    pub max_chain_depth: usize,

    /// Token budget for the rendered conversation history.
    #[serde(default = "default_history_token_budget")]
    pub history_token_budget: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            ttl_hours: default_conversation_ttl_hours(),
            max_turns: default_max_turns(),
            max_chain_depth: default_max_chain_depth(),
            history_token_budget: default_history_token_budget(),
        }
    }
}

impl ConversationConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_hours.saturating_mul(3600))
    }
}

// ============================================================================
// Storage Configuration
// ============================================================================

/// Storage backend type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    /// Bounded in-process map (single process, lost on restart).
    #[default]
    Memory,
    /// External Redis cache (multi-process).
    Redis,
}

impl std::str::FromStr for StorageBackendKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "memory" | "in-memory" | "inmemory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(format!("unknown storage backend: {other}")),
        }
    }
}

/// Redis storage configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisStorageConfig {
    /// Redis URL (redis://host:port).
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Key prefix for namespacing.
    #[serde(default = "default_redis_key_prefix")]
    pub key_prefix: String,
    /// Connection timeout in seconds.
    #[serde(default = "default_redis_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for RedisStorageConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_redis_key_prefix(),
            timeout_secs: default_redis_timeout_secs(),
        }
    }
}

/// Storage backend selection and in-process bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackendKind,

    /// Entry ceiling of the in-process backend.
    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Periodic sweep of expired in-process entries (0 disables it).
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,

    #[serde(default)]
    pub redis: RedisStorageConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackendKind::default(),
            max_entries: default_max_entries(),
            sweep_interval_secs: default_sweep_interval_secs(),
            redis: RedisStorageConfig::default(),
        }
    }
}

// ============================================================================
// Observability Configuration
// ============================================================================

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level", alias = "level")]
    pub log_level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format", alias = "format")]
    pub log_format: String,

    /// Additional module targets forced to `warn`.
    #[serde(default)]
    pub excluded_targets: Vec<String>,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: default_log_format(),
            excluded_targets: Vec::new(),
        }
    }
}

// ============================================================================
// Root Configuration
// ============================================================================

/// Root configuration for the Conduit engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub sessions: SessionsConfig,

    #[serde(default)]
    pub workspace: WorkspaceConfig,

    #[serde(default)]
    pub conversation: ConversationConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,
}

impl Config {
    /// Load configuration from the default path.
    pub fn load() -> Result<Self> {
        let path = config_path();
        if !path.exists() {
            tracing::info!("Config file not found, using defaults");
            return Ok(Self::default());
        }
        Self::load_from(&path)
    }

    /// Load configuration from a specific path.
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;

        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config from {}", path.display()))
    }

    /// Load configuration with environment variable overrides.
    pub fn load_with_env() -> Result<Self> {
        let mut config = Self::load()?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Apply environment variable overrides to the configuration.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(capacity) = lookup("CONDUIT_SESSION_CAPACITY") {
            match capacity.trim().parse() {
                Ok(c) => self.sessions.capacity = c,
                Err(_) => tracing::warn!(value = %capacity, "Ignoring invalid CONDUIT_SESSION_CAPACITY"),
            }
        }
        if let Some(timeout) = lookup("CONDUIT_SESSION_IDLE_TIMEOUT") {
            match parse_secs_or_duration(&timeout) {
                Ok(secs) => self.sessions.idle_timeout_secs = secs,
                Err(e) => tracing::warn!(error = %e, "Ignoring invalid CONDUIT_SESSION_IDLE_TIMEOUT"),
            }
        }
        if let Some(interval) = lookup("CONDUIT_REAPER_INTERVAL") {
            match parse_secs_or_duration(&interval) {
                Ok(secs) => self.sessions.reaper_interval_secs = secs,
                Err(e) => tracing::warn!(error = %e, "Ignoring invalid CONDUIT_REAPER_INTERVAL"),
            }
        }

        if let Some(roots) = lookup("CONDUIT_ALLOWED_WORKSPACES") {
            self.workspace.allowed_roots = roots
                .split([',', ':'])
                .map(str::trim)
                .filter(|root| !root.is_empty())
                .map(String::from)
                .collect();
        }

        let ttl = lookup("CONDUIT_CONVERSATION_TTL_HOURS")
            .or_else(|| lookup("CONVERSATION_TIMEOUT_HOURS"));
        if let Some(hours) = ttl {
            match hours.trim().parse() {
                Ok(h) => self.conversation.ttl_hours = h,
                Err(_) => tracing::warn!(value = %hours, "Ignoring invalid conversation TTL"),
            }
        }
        let max_turns = lookup("CONDUIT_MAX_TURNS").or_else(|| lookup("MAX_CONVERSATION_TURNS"));
        if let Some(turns) = max_turns {
            match turns.trim().parse() {
                Ok(t) => self.conversation.max_turns = t,
                Err(_) => tracing::warn!(value = %turns, "Ignoring invalid max turns"),
            }
        }

        if let Some(backend) = lookup("CONDUIT_STORAGE_BACKEND") {
            match backend.parse() {
                Ok(kind) => self.storage.backend = kind,
                Err(e) => tracing::warn!(error = %e, "Ignoring invalid CONDUIT_STORAGE_BACKEND"),
            }
        }
        if let Some(url) = lookup("CONDUIT_REDIS_URL") {
            self.storage.redis.url = url;
        }

        if let Some(level) = lookup("CONDUIT_LOG_LEVEL") {
            self.observability.log_level = level;
        }
    }
}

/// Accept either a bare number of seconds or a suffixed duration (`30m`).
fn parse_secs_or_duration(value: &str) -> std::result::Result<u64, String> {
    let value = value.trim();
    value.parse::<u64>().or_else(|_| parse_duration_secs(value))
}

fn default_session_capacity() -> usize {
    1000
}
fn default_idle_timeout_secs() -> u64 {
    3600
}
fn default_reaper_interval_secs() -> u64 {
    300
}
fn default_canonicalize_timeout_ms() -> u64 {
    2000
}
fn default_conversation_ttl_hours() -> u64 {
    3
}
fn default_max_turns() -> usize {
    50
}
fn default_max_chain_depth() -> usize {
    20
}
fn default_history_token_budget() -> usize {
    50_000
}
fn default_max_entries() -> usize {
    10_000
}
fn default_sweep_interval_secs() -> u64 {
    300
}
fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".into()
}
fn default_redis_key_prefix() -> String {
    "conduit:".into()
}
fn default_redis_timeout_secs() -> u64 {
    5
}
fn default_log_level() -> String {
    "info".into()
}
fn default_log_format() -> String {
    "pretty".into()
}
