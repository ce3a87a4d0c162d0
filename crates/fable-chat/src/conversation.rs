//! Conversation lifecycle - one durable thread per `(user, role)` pair.
//!
//! Conversations are created lazily on first chat, seeded with the role's
//! system prompt as the first durable log entry, and never hard-deleted by
//! normal flows; "reset" only collapses the live working memory.

use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use uuid::Uuid;

use fable_storage::{ChatLogStorage, ConversationStorage, PairInsert};

use crate::error::{ChatError, Result};
use crate::llm::Message;
use crate::memory::record::ChatRecord;
use crate::memory::session::SessionManager;
use crate::memory::working::DEFAULT_CONTEXT_WINDOW;

fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// One durable conversation between a user and a role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Conversation {
    /// Business key, stable for the conversation's lifetime.
    pub conversation_id: String,
    pub user_id: i64,
    pub role_id: i64,
    pub title: String,
    pub message_count: u64,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    /// Per-conversation in-memory window cap.
    pub context_window_size: usize,
    pub created_at: i64,
    pub updated_at: i64,
    pub last_message_at: Option<i64>,
}

impl Conversation {
    fn new(
        conversation_id: String,
        user_id: i64,
        role_id: i64,
        title: String,
        context_window_size: usize,
    ) -> Self {
        let now = now_ms();
        Self {
            conversation_id,
            user_id,
            role_id,
            title,
            message_count: 0,
            total_input_tokens: 0,
            total_output_tokens: 0,
            context_window_size,
            created_at: now,
            updated_at: now,
            last_message_at: None,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }
}

/// Role configuration consulted at conversation creation.
pub trait RoleProvider: Send + Sync {
    /// The role's system prompt, or None for an unknown role.
    fn system_prompt(&self, role_id: i64) -> Option<String>;

    /// Human-readable role name used for conversation titles.
    fn display_name(&self, role_id: i64) -> Option<String> {
        let _ = role_id;
        None
    }
}

/// Supplier of opaque conversation business keys.
pub trait IdProvider: Send + Sync {
    fn next_id(&self) -> String;
}

/// UUID v4 conversation ids.
#[derive(Debug, Default)]
pub struct UuidIds;

impl IdProvider for UuidIds {
    fn next_id(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

fn pair_key(user_id: i64, role_id: i64) -> String {
    format!("{user_id}:{role_id}")
}

/// Conversation lifecycle manager.
pub struct ConversationManager {
    store: ConversationStorage,
    log: ChatLogStorage,
    sessions: Arc<SessionManager>,
    roles: Arc<dyn RoleProvider>,
    ids: Arc<dyn IdProvider>,
    default_context_window: usize,
}

impl ConversationManager {
    pub fn new(
        store: ConversationStorage,
        log: ChatLogStorage,
        sessions: Arc<SessionManager>,
        roles: Arc<dyn RoleProvider>,
        ids: Arc<dyn IdProvider>,
    ) -> Self {
        Self {
            store,
            log,
            sessions,
            roles,
            ids,
            default_context_window: DEFAULT_CONTEXT_WINDOW,
        }
    }

    /// Window cap applied to newly created conversations.
    pub fn with_context_window(mut self, window: usize) -> Self {
        self.default_context_window = window;
        self
    }

    /// Get the conversation for a `(user, role)` pair, creating it on first
    /// use. Creation seeds the role's system prompt as the first durable log
    /// entry. Safe under concurrent calls: the storage layer serializes the
    /// insert, and the loser of a race adopts the winner's record.
    pub fn get_or_create(&self, user_id: i64, role_id: i64) -> Result<Conversation> {
        if let Some(existing) = self.find(user_id, role_id)? {
            self.sessions
                .set_window(&existing.conversation_id, existing.context_window_size);
            return Ok(existing);
        }

        let prompt = self
            .roles
            .system_prompt(role_id)
            .ok_or(ChatError::RoleNotFound(role_id))?;
        let role_name = self
            .roles
            .display_name(role_id)
            .unwrap_or_else(|| format!("role {role_id}"));

        let conversation = Conversation::new(
            self.ids.next_id(),
            user_id,
            role_id,
            format!("Chat with {role_name}"),
            self.default_context_window,
        );

        // The record and its seed system message commit in one storage
        // transaction: a conversation is never observable without its seed.
        let seed = ChatRecord::encode(
            &conversation.conversation_id,
            &Message::system(prompt),
            now_ms(),
        )?;

        match self.store.get_or_insert_with_seed_raw(
            &pair_key(user_id, role_id),
            &conversation.conversation_id,
            &conversation.to_bytes()?,
            &seed.to_bytes()?,
        )? {
            PairInsert::Created(id) => {
                self.sessions
                    .set_window(&id, conversation.context_window_size);
                info!(conversation_id = %id, user_id, role_id, "conversation created");
                Ok(conversation)
            }
            PairInsert::Existing(id) => {
                debug!(conversation_id = %id, user_id, role_id, "creation race lost, adopting winner");
                let winner = self.get(&id)?;
                self.sessions
                    .set_window(&id, winner.context_window_size);
                Ok(winner)
            }
        }
    }

    /// Find an existing conversation for a pair without creating one.
    pub fn find(&self, user_id: i64, role_id: i64) -> Result<Option<Conversation>> {
        match self.store.find_by_pair_raw(&pair_key(user_id, role_id))? {
            Some(bytes) => Ok(Some(Conversation::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Load a conversation by business key.
    pub fn get(&self, conversation_id: &str) -> Result<Conversation> {
        match self.store.get_raw(conversation_id)? {
            Some(bytes) => Conversation::from_bytes(&bytes),
            None => Err(ChatError::ConversationNotFound(conversation_id.to_string())),
        }
    }

    /// All conversations of a user.
    pub fn list_for_user(&self, user_id: i64) -> Result<Vec<Conversation>> {
        let prefix = format!("{user_id}:");
        let mut conversations = Vec::new();
        for bytes in self.store.list_by_pair_prefix_raw(&prefix)? {
            conversations.push(Conversation::from_bytes(&bytes)?);
        }
        Ok(conversations)
    }

    /// Reset the conversation context: collapse the live working memory back
    /// to its seed system message. The durable log keeps the full history.
    pub async fn reset(&self, conversation_id: &str) -> Result<()> {
        let mut conversation = self.get(conversation_id)?;
        self.sessions.reset(conversation_id).await?;

        conversation.updated_at = now_ms();
        self.store
            .put_raw(conversation_id, &conversation.to_bytes()?)?;
        info!(conversation_id, "conversation context reset");
        Ok(())
    }

    /// Bump the per-conversation counters after a completed model turn.
    /// Token counts may be unavailable from the model; missing values count
    /// as zero.
    pub fn update_stats(
        &self,
        conversation_id: &str,
        input_tokens: Option<u32>,
        output_tokens: Option<u32>,
    ) -> Result<Conversation> {
        let mut conversation = self.get(conversation_id)?;
        let now = now_ms();

        conversation.message_count += 1;
        conversation.total_input_tokens += u64::from(input_tokens.unwrap_or(0));
        conversation.total_output_tokens += u64::from(output_tokens.unwrap_or(0));
        conversation.last_message_at = Some(now);
        conversation.updated_at = now;

        self.store
            .put_raw(conversation_id, &conversation.to_bytes()?)?;
        Ok(conversation)
    }

    /// Remove a conversation and its entire durable log. Account/data
    /// deletion flows only.
    pub fn delete(&self, conversation_id: &str) -> Result<()> {
        let conversation = self.get(conversation_id)?;
        self.store.delete(
            conversation_id,
            &pair_key(conversation.user_id, conversation.role_id),
        )?;
        self.log.delete_all(conversation_id)?;
        self.sessions.evict(conversation_id);
        info!(conversation_id, "conversation deleted");
        Ok(())
    }
}
