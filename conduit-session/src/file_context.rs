//! Project-scoped file reader used to embed referenced files into prompts.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tokio::io::AsyncReadExt;

use conduit_common::util::{estimate_tokens, format_bytes};

/// Default per-file read cap.
pub const DEFAULT_MAX_FILE_BYTES: u64 = 256 * 1024;

#[derive(Error, Debug)]
pub enum FileContextError {
    #[error("Path {path} resolves outside the project root")]
    OutsideRoot { path: String },

    #[error("Cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// A file read for embedding.
#[derive(Debug, Clone)]
pub struct EmbeddedFile {
    /// Path relative to the project root.
    pub path: String,
    pub content: String,
    pub size_bytes: u64,
    pub truncated: bool,
}

/// Files embedded within a token budget, plus those left out and why.
#[derive(Debug, Clone, Default)]
pub struct FileContext {
    pub text: String,
    pub embedded: Vec<String>,
    pub skipped: Vec<(String, String)>,
    pub estimated_tokens: usize,
}

/// Reads files below one project root. Built once per session.
#[derive(Debug)]
pub struct FileContextProcessor {
    root: PathBuf,
    max_file_bytes: u64,
}

impl FileContextProcessor {
    /// Build a processor for `root`, which must still be a directory.
    pub async fn build(root: PathBuf, max_file_bytes: u64) -> std::io::Result<Self> {
        let metadata = tokio::fs::metadata(&root).await?;
        if !metadata.is_dir() {
            return Err(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("{} is no longer a directory", root.display()),
            ));
        }
        tracing::debug!(root = %root.display(), "File context processor built");
        Ok(Self {
            root,
            max_file_bytes: max_file_bytes.max(1),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve `path` (relative to the root, or absolute) and confirm it stays
    /// inside the root after symlinks are followed.
    pub async fn resolve(&self, path: &str) -> Result<PathBuf, FileContextError> {
        if path.contains('\0') {
            return Err(FileContextError::OutsideRoot {
                path: path.to_string(),
            });
        }
        let joined = self.root.join(path);
        let resolved = tokio::fs::canonicalize(&joined)
            .await
            .map_err(|source| FileContextError::Io {
                path: path.to_string(),
                source,
            })?;

        if !resolved.starts_with(&self.root) {
            tracing::warn!(path = %path, root = %self.root.display(), "File reference escapes project root");
            return Err(FileContextError::OutsideRoot {
                path: path.to_string(),
            });
        }
        Ok(resolved)
    }

    /// Read one file, capped at the per-file byte limit.
    pub async fn read_file(&self, path: &str) -> Result<EmbeddedFile, FileContextError> {
        let resolved = self.resolve(path).await?;
        let io_err = |source| FileContextError::Io {
            path: path.to_string(),
            source,
        };

        let file = tokio::fs::File::open(&resolved).await.map_err(io_err)?;
        let size_bytes = file.metadata().await.map_err(io_err)?.len();

        let mut buf = Vec::new();
        file.take(self.max_file_bytes)
            .read_to_end(&mut buf)
            .await
            .map_err(io_err)?;

        let relative = resolved
            .strip_prefix(&self.root)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| path.to_string());

        Ok(EmbeddedFile {
            path: relative,
            content: String::from_utf8_lossy(&buf).into_owned(),
            size_bytes,
            truncated: size_bytes > self.max_file_bytes,
        })
    }

    /// Embed `paths` in order until `token_budget` is spent.
    pub async fn embed_files(&self, paths: &[String], token_budget: usize) -> FileContext {
        let mut context = FileContext::default();

        for path in paths {
            let file = match self.read_file(path).await {
                Ok(file) => file,
                Err(e) => {
                    tracing::debug!(path = %path, error = %e, "Skipping file reference");
                    context.skipped.push((path.clone(), e.to_string()));
                    continue;
                }
            };

            let mut block = format!("--- BEGIN FILE: {} ---\n{}", file.path, file.content);
            if !block.ends_with('\n') {
                block.push('\n');
            }
            if file.truncated {
                block.push_str(&format!(
                    "[truncated: showing {} of {}]\n",
                    format_bytes(self.max_file_bytes),
                    format_bytes(file.size_bytes)
                ));
            }
            block.push_str(&format!("--- END FILE: {} ---\n", file.path));

            let cost = estimate_tokens(&block);
            if context.estimated_tokens + cost > token_budget {
                context
                    .skipped
                    .push((path.clone(), "exceeds remaining token budget".to_string()));
                continue;
            }

            context.estimated_tokens += cost;
            context.text.push_str(&block);
            context.embedded.push(file.path);
        }

        context
    }
}
