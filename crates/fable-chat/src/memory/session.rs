//! Memory session manager - one live working memory per conversation.
//!
//! The registry owns every working-memory instance; callers only interact
//! through the manager, which hydrates from the durable log at most once per
//! conversation and serializes all mutations behind a per-conversation lock.
//! Durable appends happen before the cache mutation, so a storage failure
//! never desynchronizes the cache from the log.

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::Mutex;
use tracing::debug;

use fable_storage::ChatLogStorage;

use crate::error::Result;
use crate::llm::Message;
use crate::memory::compaction::Compactor;
use crate::memory::record::ChatRecord;
use crate::memory::working::WorkingMemory;

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Keyed registry of live working memories in front of the chat log.
pub struct SessionManager {
    log: ChatLogStorage,
    compactor: Arc<Compactor>,
    context_window_size: usize,
    sessions: DashMap<String, Arc<Mutex<WorkingMemory>>>,
    windows: DashMap<String, usize>,
    turn_locks: DashMap<String, Arc<Mutex<()>>>,
}

impl SessionManager {
    pub fn new(log: ChatLogStorage, compactor: Arc<Compactor>, context_window_size: usize) -> Self {
        Self {
            log,
            compactor,
            context_window_size,
            sessions: DashMap::new(),
            windows: DashMap::new(),
            turn_locks: DashMap::new(),
        }
    }

    /// Lock serializing whole turns on one conversation.
    ///
    /// A turn spans two appends (user, then assistant) plus the stats update;
    /// the per-append session lock alone would let two concurrent turns
    /// interleave as user,user,assistant,assistant and break role alternation.
    /// Callers hold the guard from the user append until the turn is durable.
    pub fn turn_lock(&self, conversation_id: &str) -> Arc<Mutex<()>> {
        self.turn_locks
            .entry(conversation_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone()
    }

    /// Override the window cap for one conversation (from its stored
    /// configuration). Takes effect at the next hydration.
    pub fn set_window(&self, conversation_id: &str, window: usize) {
        self.windows.insert(conversation_id.to_string(), window);
    }

    /// Append a message: durable write first, then the cache.
    ///
    /// Tool-call and tool-result messages are persisted for audit but never
    /// enter the model-facing sequence.
    pub async fn append(&self, conversation_id: &str, message: Message) -> Result<()> {
        let session = self.session(conversation_id)?;
        let mut memory = session.lock().await;

        let record = ChatRecord::encode(conversation_id, &message, now_ms())?;
        self.log.append_raw(conversation_id, &record.to_bytes()?)?;

        if !message.is_tool_traffic() {
            memory.push(message);
        }
        Ok(())
    }

    /// The compacted, model-facing sequence for the next turn.
    pub async fn context(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let session = self.session(conversation_id)?;
        let snapshot = session.lock().await.messages();
        Ok(self.compactor.compact(snapshot).await)
    }

    /// The live sequence without compaction (history views, tests).
    pub async fn raw_context(&self, conversation_id: &str) -> Result<Vec<Message>> {
        let session = self.session(conversation_id)?;
        let snapshot = session.lock().await.messages();
        Ok(snapshot)
    }

    /// Collapse the live window back to its seed system message. The durable
    /// log keeps the full history.
    pub async fn reset(&self, conversation_id: &str) -> Result<()> {
        let session = self.session(conversation_id)?;
        session.lock().await.reset();
        debug!(conversation_id, "working memory reset");
        Ok(())
    }

    /// Drop a live instance from the registry. The next access re-hydrates
    /// from the log; a caller may use this as an idle-eviction hook.
    pub fn evict(&self, conversation_id: &str) {
        self.sessions.remove(conversation_id);
        self.windows.remove(conversation_id);
        self.turn_locks.remove(conversation_id);
    }

    /// Number of live working memories.
    pub fn live_sessions(&self) -> usize {
        self.sessions.len()
    }

    /// Get or hydrate the working memory for a conversation.
    ///
    /// Hydration runs under the vacant registry entry, so two concurrent
    /// first accesses cannot hydrate the same conversation twice.
    fn session(&self, conversation_id: &str) -> Result<Arc<Mutex<WorkingMemory>>> {
        if let Some(existing) = self.sessions.get(conversation_id) {
            return Ok(existing.value().clone());
        }

        match self.sessions.entry(conversation_id.to_string()) {
            Entry::Occupied(entry) => Ok(entry.get().clone()),
            Entry::Vacant(entry) => {
                let memory = self.hydrate(conversation_id)?;
                Ok(entry.insert(Arc::new(Mutex::new(memory))).value().clone())
            }
        }
    }

    fn hydrate(&self, conversation_id: &str) -> Result<WorkingMemory> {
        let window = self
            .windows
            .get(conversation_id)
            .map(|w| *w)
            .unwrap_or(self.context_window_size);

        let mut history = Vec::new();
        for bytes in self.log.read_all_raw(conversation_id)? {
            let message = ChatRecord::from_bytes(&bytes)?.decode()?;
            if message.is_tool_traffic() {
                continue;
            }
            history.push(message);
        }

        debug!(
            conversation_id,
            messages = history.len(),
            "hydrated working memory"
        );
        Ok(WorkingMemory::from_history(history, window))
    }
}
