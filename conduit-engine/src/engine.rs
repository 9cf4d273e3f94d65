//! Composition root and request augmentation.

use std::sync::Arc;

use anyhow::Context;
use uuid::Uuid;

use conduit_common::util::truncate_with_ellipsis;
use conduit_common::{Config, Validate};
use conduit_conversation::{
    build_history, collect_file_references, collect_image_references, ConversationError,
    ThreadStore, Turn,
};
use conduit_session::{ReaperHandle, SessionManager, SessionReaper};
use conduit_storage::{create_storage_async, StorageHandle};

use crate::request::{Continuation, PreparedRequest, SessionAttachment, ToolRequest, ToolResponse};

/// Owns the storage backend, thread store, session registry and reaper.
pub struct Engine {
    storage: StorageHandle,
    threads: ThreadStore,
    sessions: Arc<SessionManager>,
    reaper: ReaperHandle,
    history_token_budget: usize,
}

impl Engine {
    /// Validate `config` and build every component. Starts the session reaper
    /// and, for the in-memory backend, the storage sweeper.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        config
            .validate()
            .map_err(|e| anyhow::anyhow!("Invalid configuration: {e}"))?;

        let storage = create_storage_async(&config.storage)
            .await
            .context("Failed to initialize storage backend")?;
        let threads = ThreadStore::new(Arc::clone(&storage.backend), &config.conversation);
        let sessions = Arc::new(SessionManager::from_config(config));
        let reaper =
            SessionReaper::new(Arc::clone(&sessions), config.sessions.reaper_interval()).spawn();

        tracing::info!(
            storage = storage.backend.name(),
            session_capacity = sessions.capacity(),
            allowed_roots = sessions.policy().allowed_roots().len(),
            max_turns = threads.max_turns(),
            "Conduit engine started"
        );

        Ok(Self {
            storage,
            threads,
            sessions,
            reaper,
            history_token_budget: config.conversation.history_token_budget,
        })
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn threads(&self) -> &ThreadStore {
        &self.threads
    }

    pub fn storage_name(&self) -> &'static str {
        self.storage.backend.name()
    }

    /// Attach a session and recover prior conversation context.
    pub async fn prepare(&self, request: ToolRequest) -> conduit_common::Result<PreparedRequest> {
        let session = self.attach_session(&request).await?;
        let continuation = self.resolve_continuation(&request, &session).await?;
        Ok(PreparedRequest {
            request,
            session,
            continuation,
        })
    }

    async fn attach_session(
        &self,
        request: &ToolRequest,
    ) -> conduit_common::Result<SessionAttachment> {
        let session_id = request.session_id.as_deref();
        let project_root = request.project_root.as_deref();

        let attachment = match (session_id, project_root) {
            (Some(id), Some(root)) => {
                SessionAttachment::Attached(self.sessions.get_or_create(id, root).await?)
            }
            (None, Some(root)) => {
                let id = Uuid::new_v4().to_string();
                SessionAttachment::Attached(self.sessions.get_or_create(&id, root).await?)
            }
            (Some(id), None) => match self.sessions.get(id)? {
                Some(session) => SessionAttachment::Attached(session),
                None => {
                    tracing::debug!(session_id = %id, "Unknown session and no project root");
                    SessionAttachment::None
                }
            },
            (None, None) => SessionAttachment::None,
        };
        Ok(attachment)
    }

    async fn resolve_continuation(
        &self,
        request: &ToolRequest,
        session: &SessionAttachment,
    ) -> conduit_common::Result<Continuation> {
        let Some(continuation_id) = request.continuation_id.as_deref() else {
            return Ok(Continuation::Fresh);
        };

        let chain = self.threads.get_thread_chain(continuation_id).await?;
        let Some(current) = chain.last() else {
            tracing::info!(
                continuation_id = %continuation_id,
                "Continuation not found or expired"
            );
            return Ok(Continuation::Expired {
                continuation_id: continuation_id.to_string(),
            });
        };
        let thread_id = current.thread_id;

        let turns: Vec<Turn> = chain
            .iter()
            .flat_map(|thread| thread.turns.iter().cloned())
            .collect();
        let files = collect_file_references(&turns);
        let images = collect_image_references(&turns);
        let history = build_history(&turns, self.history_token_budget);

        let embedded_files = match session.session() {
            Some(session) => {
                let processor = session.file_context().await?;
                let paths: Vec<String> = files.iter().map(|f| f.path.clone()).collect();
                let budget = self
                    .history_token_budget
                    .saturating_sub(history.estimated_tokens);
                Some(processor.embed_files(&paths, budget).await)
            }
            None => None,
        };

        tracing::debug!(
            thread_id = %thread_id,
            chain_len = chain.len(),
            turns = turns.len(),
            history_turns = history.included_turns,
            files = files.len(),
            "Continuation resumed"
        );

        Ok(Continuation::Resumed {
            thread_id,
            chain: chain.iter().map(|thread| thread.thread_id).collect(),
            files,
            images,
            history,
            embedded_files,
        })
    }

    /// Record the agent's request and the tool's response. Returns the
    /// continuation id the client should send next time.
    pub async fn record_exchange(
        &self,
        prepared: &PreparedRequest,
        response: ToolResponse,
    ) -> conduit_common::Result<Uuid> {
        let request = &prepared.request;
        tracing::debug!(
            tool = %request.tool_name,
            response = %truncate_with_ellipsis(&response.content, 80),
            "Recording exchange"
        );

        let agent_turn = Turn::agent(request.prompt.clone())
            .with_tool_name(request.tool_name.clone())
            .with_files(request.files.iter().cloned())
            .with_images(request.images.iter().cloned());

        let mut tool_turn = Turn::tool(response.content)
            .with_tool_name(request.tool_name.clone())
            .with_files(response.files);
        if let (Some(provider), Some(name)) = (response.model_provider, response.model_name) {
            tool_turn = tool_turn.with_model(provider, name);
        }
        if let Some(metadata) = response.metadata {
            tool_turn = tool_turn.with_metadata(metadata);
        }

        let Some(thread_id) = prepared.continuation.thread_id() else {
            return self.start_thread(None, agent_turn, tool_turn).await;
        };

        match self
            .threads
            .add_turns(
                &thread_id.to_string(),
                vec![agent_turn.clone(), tool_turn.clone()],
            )
            .await
        {
            Ok(()) => Ok(thread_id),
            Err(ConversationError::TurnLimitReached { .. }) => {
                tracing::info!(thread_id = %thread_id, "Turn limit reached, continuing in a new thread");
                self.start_thread(Some(thread_id), agent_turn, tool_turn).await
            }
            Err(ConversationError::ThreadNotFound { .. }) => {
                tracing::info!(thread_id = %thread_id, "Thread expired before the response was recorded");
                self.start_thread(None, agent_turn, tool_turn).await
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn start_thread(
        &self,
        parent: Option<Uuid>,
        agent_turn: Turn,
        tool_turn: Turn,
    ) -> conduit_common::Result<Uuid> {
        let thread_id = self
            .threads
            .create_thread_with_turns(vec![agent_turn, tool_turn], parent)
            .await?;
        Ok(thread_id)
    }

    /// Stop the reaper, then the storage sweeper, then close the backend.
    pub async fn shutdown(self) -> conduit_common::Result<()> {
        self.reaper.stop().await;
        self.storage.shutdown().await?;
        tracing::info!("Conduit engine stopped");
        Ok(())
    }
}
