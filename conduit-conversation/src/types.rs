//! Conversation thread and turn types.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use conduit_common::util::estimate_tokens;

/// Who produced a turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    /// The requesting agent.
    Agent,
    /// The responding tool.
    Tool,
}

impl TurnRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Agent => "agent",
            Self::Tool => "tool",
        }
    }
}

impl std::fmt::Display for TurnRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded exchange within a thread. Turns are never modified once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: TurnRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub timestamp: DateTime<Utc>,
    /// Paths referenced by this turn, in the order the caller gave them.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_provider: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_metadata: Option<serde_json::Value>,
}

impl Turn {
    /// Create a turn stamped with the current time.
    pub fn new(role: TurnRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_name: None,
            timestamp: Utc::now(),
            files: Vec::new(),
            images: Vec::new(),
            model_provider: None,
            model_name: None,
            model_metadata: None,
        }
    }

    pub fn agent(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Agent, content)
    }

    pub fn tool(content: impl Into<String>) -> Self {
        Self::new(TurnRole::Tool, content)
    }

    pub fn with_tool_name(mut self, tool_name: impl Into<String>) -> Self {
        self.tool_name = Some(tool_name.into());
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

    pub fn with_model(mut self, provider: impl Into<String>, name: impl Into<String>) -> Self {
        self.model_provider = Some(provider.into());
        self.model_name = Some(name.into());
        self
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.model_metadata = Some(metadata);
        self
    }

    /// Estimated token cost of the turn's content.
    pub fn token_estimate(&self) -> usize {
        estimate_tokens(&self.content)
    }
}

/// An append-only sequence of turns addressed by a continuation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationThread {
    pub thread_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_thread_id: Option<Uuid>,
    pub created_at: DateTime<Utc>,
    pub last_updated_at: DateTime<Utc>,
    /// Tool that opened the thread.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    pub turns: Vec<Turn>,
}

impl ConversationThread {
    pub(crate) fn new(initial_turn: Turn, parent_thread_id: Option<Uuid>) -> Self {
        let now = Utc::now();
        Self {
            thread_id: Uuid::new_v4(),
            parent_thread_id,
            created_at: now,
            last_updated_at: now,
            tool_name: initial_turn.tool_name.clone(),
            turns: vec![initial_turn],
        }
    }

    pub fn turn_count(&self) -> usize {
        self.turns.len()
    }

    pub fn last_turn(&self) -> Option<&Turn> {
        self.turns.last()
    }
}
