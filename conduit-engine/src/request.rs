//! Request and response shapes exchanged with the tool-invocation layer.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use conduit_conversation::{ConversationHistory, FileReference};
use conduit_session::{FileContext, Session};

/// Inbound tool call, reduced to the fields the engine reads.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolRequest {
    pub tool_name: String,
    pub prompt: String,
    #[serde(default)]
    pub continuation_id: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub project_root: Option<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub images: Vec<String>,
}

impl ToolRequest {
    pub fn new(tool_name: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_continuation(mut self, continuation_id: impl Into<String>) -> Self {
        self.continuation_id = Some(continuation_id.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_project_root(mut self, project_root: impl Into<String>) -> Self {
        self.project_root = Some(project_root.into());
        self
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_images<I, S>(mut self, images: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.images = images.into_iter().map(Into::into).collect();
        self
    }
}

/// What the tool produced for a request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolResponse {
    pub content: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub model_provider: Option<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
}

impl ToolResponse {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Self::default()
        }
    }

    pub fn with_files<I, S>(mut self, files: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.files = files.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_model(mut self, provider: impl Into<String>, name: impl Into<String>) -> Self {
        self.model_provider = Some(provider.into());
        self.model_name = Some(name.into());
        self
    }
}

/// Session bound to a request, or the explicit absence of one.
#[derive(Debug, Clone)]
pub enum SessionAttachment {
    Attached(Arc<Session>),
    None,
}

impl SessionAttachment {
    pub fn session(&self) -> Option<&Arc<Session>> {
        match self {
            Self::Attached(session) => Some(session),
            Self::None => None,
        }
    }
}

/// Prior context recovered for a request.
#[derive(Debug, Clone)]
pub enum Continuation {
    /// No continuation id supplied.
    Fresh,
    /// The thread (and its ancestors) were found.
    Resumed {
        thread_id: Uuid,
        /// Thread ids in the chain, oldest first. The last one is `thread_id`.
        chain: Vec<Uuid>,
        files: Vec<FileReference>,
        images: Vec<FileReference>,
        history: ConversationHistory,
        /// File contents, when a session supplied a project root to read from.
        embedded_files: Option<FileContext>,
    },
    /// The id was unknown, expired or malformed. The caller decides whether
    /// to start over or tell the user.
    Expired { continuation_id: String },
}

impl Continuation {
    pub fn thread_id(&self) -> Option<Uuid> {
        match self {
            Self::Resumed { thread_id, .. } => Some(*thread_id),
            _ => None,
        }
    }
}

/// A request with its session and continuation resolved.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub request: ToolRequest,
    pub session: SessionAttachment,
    pub continuation: Continuation,
}
