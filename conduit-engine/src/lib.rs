//! Conduit - session and conversation state for agent tool-invocation servers.
//!
//! The surrounding server hands each inbound tool call to [`Engine::prepare`],
//! dispatches the prepared request to its tool, then calls
//! [`Engine::record_exchange`] with the tool's response:
//!
//! ```text
//! ToolRequest ──► Engine::prepare ──► PreparedRequest ──► tool
//!                  ├─ SessionManager (session_id / project_root)
//!                  └─ ThreadStore    (continuation_id)
//! ToolResponse ─► Engine::record_exchange ──► continuation id
//! ```
//!
//! Sessions and conversations are independent: a request may carry either,
//! both or neither.

pub mod engine;
pub mod request;

pub use engine::Engine;
pub use request::{Continuation, PreparedRequest, SessionAttachment, ToolRequest, ToolResponse};

pub use conduit_common::{Config, Error, Result};
