//! Workspace-path validation.
//!
//! Every project root is canonicalized (symlinks and `..` resolved) and must
//! land on or below an allow-listed root before a session may be built for it.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use conduit_common::config::{SessionsConfig, WorkspaceConfig};

/// Project-root validation failures.
#[derive(Error, Debug)]
pub enum WorkspaceError {
    #[error("Invalid project root {path:?}: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("Cannot resolve project root {path}: {source}")]
    Canonicalize {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Resolving project root {path} timed out after {timeout_ms}ms")]
    CanonicalizeTimeout { path: String, timeout_ms: u64 },

    #[error("Project root {} is outside the allowed workspaces", path.display())]
    OutsideAllowList { path: PathBuf },

    #[error("Project root {} is not a directory", path.display())]
    NotADirectory { path: PathBuf },
}

/// Allow-list of workspace roots plus the canonicalization deadline.
#[derive(Debug, Clone)]
pub struct WorkspacePolicy {
    allowed_roots: Vec<PathBuf>,
    canonicalize_timeout: Duration,
}

impl WorkspacePolicy {
    /// Build a policy. Roots are canonicalized when they exist and kept as
    /// given otherwise.
    pub fn new<I>(allowed_roots: I, canonicalize_timeout: Duration) -> Self
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let allowed_roots: Vec<PathBuf> = allowed_roots
            .into_iter()
            .map(|root| std::fs::canonicalize(&root).unwrap_or(root))
            .collect();

        if allowed_roots.is_empty() {
            tracing::warn!("Workspace allow-list is empty; every project root will be rejected");
        }

        Self {
            allowed_roots,
            canonicalize_timeout,
        }
    }

    pub fn from_config(workspace: &WorkspaceConfig, sessions: &SessionsConfig) -> Self {
        Self::new(workspace.expanded_roots(), sessions.canonicalize_timeout())
    }

    pub fn allowed_roots(&self) -> &[PathBuf] {
        &self.allowed_roots
    }

    /// Whether an already-canonical path is on or below an allowed root.
    pub fn is_allowed(&self, canonical: &Path) -> bool {
        self.allowed_roots
            .iter()
            .any(|root| canonical.starts_with(root))
    }

    /// Validate `project_root` and return its canonical form.
    pub async fn validate(&self, project_root: &str) -> Result<PathBuf, WorkspaceError> {
        let invalid = |reason| WorkspaceError::InvalidPath {
            path: project_root.to_string(),
            reason,
        };

        if project_root.trim().is_empty() {
            return Err(invalid("empty path"));
        }
        if project_root.contains('\0') {
            return Err(invalid("contains a NUL byte"));
        }
        if !Path::new(project_root).is_absolute() {
            return Err(invalid("must be an absolute path"));
        }

        let canonical =
            match tokio::time::timeout(self.canonicalize_timeout, tokio::fs::canonicalize(project_root))
                .await
            {
                Ok(Ok(path)) => path,
                Ok(Err(source)) => {
                    return Err(WorkspaceError::Canonicalize {
                        path: project_root.to_string(),
                        source,
                    })
                }
                Err(_) => {
                    return Err(WorkspaceError::CanonicalizeTimeout {
                        path: project_root.to_string(),
                        timeout_ms: u64::try_from(self.canonicalize_timeout.as_millis())
                            .unwrap_or(u64::MAX),
                    })
                }
            };

        if !self.is_allowed(&canonical) {
            return Err(WorkspaceError::OutsideAllowList { path: canonical });
        }

        let metadata = tokio::fs::metadata(&canonical)
            .await
            .map_err(|source| WorkspaceError::Canonicalize {
                path: project_root.to_string(),
                source,
            })?;
        if !metadata.is_dir() {
            return Err(WorkspaceError::NotADirectory { path: canonical });
        }

        Ok(canonical)
    }
}
