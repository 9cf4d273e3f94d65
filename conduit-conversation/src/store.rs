//! Thread persistence on top of an expiring key-value backend.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use uuid::Uuid;

use conduit_common::config::ConversationConfig;
use conduit_storage::StorageBackend;

use crate::types::{ConversationThread, Turn};
use crate::{ConversationError, ConversationResult};

const KEY_PREFIX: &str = "thread:";

/// Stores conversation threads as JSON under `thread:{uuid}`.
///
/// Appends to one thread are serialized within the process by a per-thread
/// lock so the read-modify-write never loses a turn. Appends to different
/// threads proceed independently. The lock does not span processes; two
/// servers sharing one Redis can still race on the same thread.
pub struct ThreadStore {
    backend: Arc<dyn StorageBackend>,
    ttl: Duration,
    max_turns: usize,
    max_chain_depth: usize,
    append_locks: ThreadLocks,
}

type ThreadLocks = StdMutex<HashMap<Uuid, Arc<Mutex<()>>>>;

/// Held for the duration of one append. Dropping it releases the thread's
/// lock and forgets the entry once nobody else is waiting on it.
struct AppendGuard<'a> {
    locks: &'a ThreadLocks,
    thread_id: Uuid,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for AppendGuard<'_> {
    fn drop(&mut self) {
        drop(self.guard.take());
        if let Ok(mut locks) = self.locks.lock() {
            let idle = locks
                .get(&self.thread_id)
                .is_some_and(|lock| Arc::strong_count(lock) == 1);
            if idle {
                locks.remove(&self.thread_id);
            }
        }
    }
}

impl ThreadStore {
    pub fn new(backend: Arc<dyn StorageBackend>, config: &ConversationConfig) -> Self {
        Self {
            backend,
            ttl: config.ttl(),
            max_turns: config.max_turns,
            max_chain_depth: config.max_chain_depth,
            append_locks: StdMutex::new(HashMap::new()),
        }
    }

    async fn lock_thread(&self, thread_id: Uuid) -> ConversationResult<AppendGuard<'_>> {
        let lock = {
            let mut locks = self.append_locks.lock().map_err(|_| {
                ConversationError::InvariantViolation("thread lock table poisoned".to_string())
            })?;
            Arc::clone(locks.entry(thread_id).or_default())
        };
        Ok(AppendGuard {
            locks: &self.append_locks,
            thread_id,
            guard: Some(lock.lock_owned().await),
        })
    }

    pub fn max_turns(&self) -> usize {
        self.max_turns
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Parse a continuation id. Anything that is not a UUID is treated as unknown.
    pub fn parse_thread_id(thread_id: &str) -> Option<Uuid> {
        Uuid::parse_str(thread_id.trim()).ok()
    }

    fn key(thread_id: &Uuid) -> String {
        format!("{KEY_PREFIX}{thread_id}")
    }

    async fn load(&self, thread_id: &Uuid) -> ConversationResult<Option<ConversationThread>> {
        let Some(bytes) = self.backend.get(&Self::key(thread_id)).await? else {
            return Ok(None);
        };
        let thread: ConversationThread = serde_json::from_slice(&bytes)?;
        if thread.thread_id != *thread_id {
            return Err(ConversationError::InvariantViolation(format!(
                "key {} holds thread {}",
                Self::key(thread_id),
                thread.thread_id
            )));
        }
        Ok(Some(thread))
    }

    async fn save(&self, thread: &ConversationThread) -> ConversationResult<()> {
        let bytes = serde_json::to_vec(thread)?;
        self.backend
            .set(&Self::key(&thread.thread_id), bytes, self.ttl)
            .await?;
        Ok(())
    }

    /// Start a new thread holding `initial_turn`.
    pub async fn create_thread(&self, initial_turn: Turn) -> ConversationResult<Uuid> {
        self.create_thread_with_parent(initial_turn, None).await
    }

    /// Start a new thread linked to `parent` so history can be rebuilt across
    /// the boundary.
    pub async fn create_thread_with_parent(
        &self,
        initial_turn: Turn,
        parent: Option<Uuid>,
    ) -> ConversationResult<Uuid> {
        self.create_thread_with_turns(vec![initial_turn], parent).await
    }

    /// Start a new thread holding every turn in `turns`, written in one save.
    /// Nothing is stored when `turns` is empty or exceeds the turn limit.
    pub async fn create_thread_with_turns(
        &self,
        turns: Vec<Turn>,
        parent: Option<Uuid>,
    ) -> ConversationResult<Uuid> {
        let mut turns = turns.into_iter();
        let Some(first) = turns.next() else {
            return Err(ConversationError::InvariantViolation(
                "a thread needs at least one turn".to_string(),
            ));
        };
        let mut thread = ConversationThread::new(first, parent);
        thread.turns.extend(turns);

        if thread.turns.len() > self.max_turns {
            return Err(ConversationError::TurnLimitReached {
                thread_id: thread.thread_id.to_string(),
                max_turns: self.max_turns,
            });
        }
        self.save(&thread).await?;

        tracing::info!(
            thread_id = %thread.thread_id,
            parent_thread_id = ?parent,
            tool_name = ?thread.tool_name,
            turns = thread.turns.len(),
            "Conversation thread created"
        );
        Ok(thread.thread_id)
    }

    /// Append a turn and re-arm the thread's TTL.
    pub async fn add_turn(&self, thread_id: &str, turn: Turn) -> ConversationResult<()> {
        self.add_turns(thread_id, vec![turn]).await
    }

    /// Append several turns as one write. Either all fit under the turn limit
    /// or none are stored.
    pub async fn add_turns(&self, thread_id: &str, turns: Vec<Turn>) -> ConversationResult<()> {
        let not_found = || ConversationError::ThreadNotFound {
            thread_id: thread_id.to_string(),
        };
        let id = Self::parse_thread_id(thread_id).ok_or_else(not_found)?;

        let _guard = self.lock_thread(id).await?;
        let mut thread = self.load(&id).await?.ok_or_else(not_found)?;

        let count = thread.turns.len();
        if count > self.max_turns {
            tracing::error!(
                thread_id = %id,
                turns = count,
                max_turns = self.max_turns,
                "Stored thread exceeds the turn limit"
            );
            return Err(ConversationError::InvariantViolation(format!(
                "thread {id} holds {count} turns, limit is {}",
                self.max_turns
            )));
        }
        if count + turns.len() > self.max_turns {
            tracing::debug!(thread_id = %id, max_turns = self.max_turns, "Turn limit reached");
            return Err(ConversationError::TurnLimitReached {
                thread_id: id.to_string(),
                max_turns: self.max_turns,
            });
        }
        if turns.is_empty() {
            return Ok(());
        }

        thread.turns.extend(turns);
        thread.last_updated_at = Utc::now();
        self.save(&thread).await?;

        tracing::debug!(thread_id = %id, turns = thread.turns.len(), "Turns appended");
        Ok(())
    }

    /// Fetch a thread without touching its TTL.
    pub async fn get_thread(&self, thread_id: &str) -> ConversationResult<Option<ConversationThread>> {
        match Self::parse_thread_id(thread_id) {
            Some(id) => self.load(&id).await,
            None => {
                tracing::debug!(thread_id = %thread_id, "Malformed continuation id");
                Ok(None)
            }
        }
    }

    /// Follow parent links from `thread_id` and return the chain oldest-first.
    ///
    /// Stops at the first missing parent, a repeated id or the configured depth.
    /// Returns an empty chain when `thread_id` itself is unknown.
    pub async fn get_thread_chain(
        &self,
        thread_id: &str,
    ) -> ConversationResult<Vec<ConversationThread>> {
        let mut chain = Vec::new();
        let mut seen = HashSet::new();
        let mut next = Self::parse_thread_id(thread_id);

        while let Some(id) = next {
            if chain.len() >= self.max_chain_depth.max(1) {
                tracing::debug!(thread_id = %thread_id, depth = chain.len(), "Thread chain truncated");
                break;
            }
            if !seen.insert(id) {
                tracing::warn!(thread_id = %id, "Cycle in thread parent links");
                break;
            }
            let Some(thread) = self.load(&id).await? else {
                break;
            };
            next = thread.parent_thread_id;
            chain.push(thread);
        }

        chain.reverse();
        Ok(chain)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conduit_storage::InMemoryStorage;

    fn store_with(max_turns: usize) -> ThreadStore {
        let config = ConversationConfig {
            max_turns,
            ..ConversationConfig::default()
        };
        ThreadStore::new(Arc::new(InMemoryStorage::new()), &config)
    }

    #[tokio::test]
    async fn test_create_and_get() {
        let store = store_with(50);
        let id = store
            .create_thread(Turn::agent("hello").with_tool_name("chat"))
            .await
            .unwrap();

        let thread = store.get_thread(&id.to_string()).await.unwrap().unwrap();
        assert_eq!(thread.thread_id, id);
        assert_eq!(thread.turns.len(), 1);
        assert_eq!(thread.tool_name.as_deref(), Some("chat"));
        assert!(thread.parent_thread_id.is_none());
    }

    #[tokio::test]
    async fn test_create_thread_with_turns_writes_once() {
        let backend = Arc::new(InMemoryStorage::new());
        let config = ConversationConfig {
            max_turns: 2,
            ..ConversationConfig::default()
        };
        let store = ThreadStore::new(backend.clone(), &config);

        let turns = vec![Turn::agent("1"), Turn::tool("2"), Turn::agent("3")];
        let err = store.create_thread_with_turns(turns, None).await.unwrap_err();
        assert!(matches!(err, ConversationError::TurnLimitReached { max_turns: 2, .. }));
        assert!(backend.is_empty());

        let err = store.create_thread_with_turns(Vec::new(), None).await.unwrap_err();
        assert!(matches!(err, ConversationError::InvariantViolation(_)));

        let id = store
            .create_thread_with_turns(vec![Turn::agent("1"), Turn::tool("2")], None)
            .await
            .unwrap();
        let thread = store.get_thread(&id.to_string()).await.unwrap().unwrap();
        assert_eq!(thread.turns.len(), 2);
        assert_eq!(backend.len(), 1);
    }

    #[tokio::test]
    async fn test_huge_ttl_is_an_error_not_a_panic() {
        let config = ConversationConfig {
            ttl_hours: u64::MAX / 2,
            ..ConversationConfig::default()
        };
        let store = ThreadStore::new(Arc::new(InMemoryStorage::new()), &config);

        let err = store.create_thread(Turn::agent("x")).await.unwrap_err();
        assert!(matches!(err, ConversationError::Storage(_)));
    }

    #[tokio::test]
    async fn test_add_turn_unknown_thread() {
        let store = store_with(50);
        let err = store
            .add_turn(&Uuid::new_v4().to_string(), Turn::tool("hi"))
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_malformed_id_behaves_as_not_found() {
        let store = store_with(50);
        assert!(store.get_thread("not-a-uuid").await.unwrap().is_none());

        let err = store.add_turn("../../etc", Turn::tool("hi")).await.unwrap_err();
        assert!(err.is_not_found());
        assert!(store.get_thread_chain("nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_turn_limit_is_hard_stop() {
        let store = store_with(3);
        let id = store.create_thread(Turn::agent("1")).await.unwrap().to_string();
        store.add_turn(&id, Turn::tool("2")).await.unwrap();
        store.add_turn(&id, Turn::agent("3")).await.unwrap();

        let err = store.add_turn(&id, Turn::tool("4")).await.unwrap_err();
        assert!(matches!(
            err,
            ConversationError::TurnLimitReached { max_turns: 3, .. }
        ));

        let thread = store.get_thread(&id).await.unwrap().unwrap();
        let contents: Vec<_> = thread.turns.iter().map(|t| t.content.as_str()).collect();
        assert_eq!(contents, vec!["1", "2", "3"]);
    }

    #[tokio::test]
    async fn test_add_turns_all_or_nothing() {
        let store = store_with(3);
        let id = store.create_thread(Turn::agent("1")).await.unwrap().to_string();
        store.add_turn(&id, Turn::tool("2")).await.unwrap();

        let err = store
            .add_turns(&id, vec![Turn::agent("3"), Turn::tool("4")])
            .await
            .unwrap_err();
        assert!(matches!(err, ConversationError::TurnLimitReached { .. }));
        assert_eq!(store.get_thread(&id).await.unwrap().unwrap().turns.len(), 2);

        store.add_turns(&id, vec![Turn::agent("3")]).await.unwrap();
        assert_eq!(store.get_thread(&id).await.unwrap().unwrap().turns.len(), 3);
    }

    #[tokio::test]
    async fn test_overfull_thread_is_invariant_violation() {
        let backend = Arc::new(InMemoryStorage::new());
        let config = ConversationConfig {
            max_turns: 2,
            ..ConversationConfig::default()
        };
        let store = ThreadStore::new(backend.clone(), &config);

        let mut thread = ConversationThread::new(Turn::agent("1"), None);
        thread.turns.push(Turn::tool("2"));
        thread.turns.push(Turn::agent("3"));
        backend
            .set(
                &ThreadStore::key(&thread.thread_id),
                serde_json::to_vec(&thread).unwrap(),
                Duration::from_secs(60),
            )
            .await
            .unwrap();

        let err = store
            .add_turn(&thread.thread_id.to_string(), Turn::tool("4"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConversationError::InvariantViolation(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_rearms_ttl_and_reads_do_not() {
        let store = store_with(50);
        let ttl = store.ttl();
        let id = store.create_thread(Turn::agent("1")).await.unwrap().to_string();

        tokio::time::advance(ttl - Duration::from_secs(10)).await;
        store.add_turn(&id, Turn::tool("2")).await.unwrap();

        tokio::time::advance(ttl - Duration::from_secs(10)).await;
        assert!(store.get_thread(&id).await.unwrap().is_some());

        tokio::time::advance(Duration::from_secs(11)).await;
        assert!(store.get_thread(&id).await.unwrap().is_none());
        assert!(store.add_turn(&id, Turn::agent("3")).await.unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn test_concurrent_appends_are_not_lost() {
        let store = Arc::new(store_with(100));
        let id = store.create_thread(Turn::agent("start")).await.unwrap().to_string();

        let mut tasks = Vec::new();
        for i in 0..20 {
            let store = Arc::clone(&store);
            let id = id.clone();
            tasks.push(tokio::spawn(async move {
                store.add_turn(&id, Turn::tool(format!("turn {i}"))).await
            }));
        }
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        let thread = store.get_thread(&id).await.unwrap().unwrap();
        assert_eq!(thread.turns.len(), 21);
        assert!(store.append_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_busy_thread_does_not_block_others() {
        let store = store_with(50);
        let busy = store.create_thread(Turn::agent("a")).await.unwrap();
        let other = store.create_thread(Turn::agent("b")).await.unwrap();

        let held = store.lock_thread(busy).await.unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            store.add_turn(&other.to_string(), Turn::tool("reply")),
        )
        .await
        .expect("append to an unrelated thread stalled")
        .unwrap();

        let busy_id = busy.to_string();
        let pending = store.add_turn(&busy_id, Turn::tool("later"));
        tokio::pin!(pending);
        assert!(
            tokio::time::timeout(Duration::from_millis(50), &mut pending)
                .await
                .is_err()
        );

        drop(held);
        pending.await.unwrap();
        assert_eq!(
            store.get_thread(&busy.to_string()).await.unwrap().unwrap().turns.len(),
            2
        );
        assert!(store.append_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_thread_chain_oldest_first() {
        let store = store_with(50);
        let first = store.create_thread(Turn::agent("a")).await.unwrap();
        let second = store
            .create_thread_with_parent(Turn::agent("b"), Some(first))
            .await
            .unwrap();
        let third = store
            .create_thread_with_parent(Turn::agent("c"), Some(second))
            .await
            .unwrap();

        let chain = store.get_thread_chain(&third.to_string()).await.unwrap();
        let ids: Vec<_> = chain.iter().map(|t| t.thread_id).collect();
        assert_eq!(ids, vec![first, second, third]);
    }

    #[tokio::test]
    async fn test_thread_chain_depth_limited() {
        let config = ConversationConfig {
            max_chain_depth: 2,
            ..ConversationConfig::default()
        };
        let store = ThreadStore::new(Arc::new(InMemoryStorage::new()), &config);

        let mut parent = None;
        for i in 0..5 {
            parent = Some(
                store
                    .create_thread_with_parent(Turn::agent(i.to_string()), parent)
                    .await
                    .unwrap(),
            );
        }

        let chain = store
            .get_thread_chain(&parent.unwrap().to_string())
            .await
            .unwrap();
        assert_eq!(chain.len(), 2);
        assert_eq!(chain[1].thread_id, parent.unwrap());
    }

    #[tokio::test]
    async fn test_thread_chain_survives_cycle() {
        let backend = Arc::new(InMemoryStorage::new());
        let store = ThreadStore::new(backend.clone(), &ConversationConfig::default());

        let mut a = ConversationThread::new(Turn::agent("a"), None);
        let b = ConversationThread::new(Turn::agent("b"), Some(a.thread_id));
        a.parent_thread_id = Some(b.thread_id);
        for thread in [&a, &b] {
            backend
                .set(
                    &ThreadStore::key(&thread.thread_id),
                    serde_json::to_vec(thread).unwrap(),
                    Duration::from_secs(60),
                )
                .await
                .unwrap();
        }

        let chain = store.get_thread_chain(&b.thread_id.to_string()).await.unwrap();
        assert_eq!(chain.len(), 2);
    }
}
