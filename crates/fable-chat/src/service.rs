//! Chat turn service - one streaming model turn end to end.
//!
//! A turn appends the user message (write-through), reads the compacted
//! context, streams the model's reply to the caller, and persists the
//! assistant message plus conversation stats only once the stream completes.
//! A mid-stream error or a dropped consumer leaves no partial assistant
//! message in the durable log.

use std::sync::Arc;

use async_stream::try_stream;
use futures::StreamExt;
use futures::stream::BoxStream;
use tracing::{debug, error};

use crate::conversation::ConversationManager;
use crate::error::{ChatError, Result};
use crate::llm::{CompletionRequest, LlmClient, Message, StreamChunk, TokenUsage};
use crate::memory::session::SessionManager;

/// Events delivered to the transport layer during a turn.
#[derive(Debug, Clone)]
pub enum ChatEvent {
    /// A partial reply fragment.
    Delta(String),
    /// Terminal event: the reply is complete and durably recorded.
    Done {
        conversation_id: String,
        reply: String,
        usage: Option<TokenUsage>,
    },
}

/// Ordered stream of chat events ending in `Done` or an error.
pub type ChatStream = BoxStream<'static, Result<ChatEvent>>;

/// Orchestrates model turns over the memory and lifecycle managers.
pub struct ChatService {
    conversations: Arc<ConversationManager>,
    sessions: Arc<SessionManager>,
    llm: Arc<dyn LlmClient>,
}

impl ChatService {
    pub fn new(
        conversations: Arc<ConversationManager>,
        sessions: Arc<SessionManager>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        Self {
            conversations,
            sessions,
            llm,
        }
    }

    /// Run one streaming turn for a `(user, role)` pair.
    ///
    /// The user message is durably appended before the model is invoked; the
    /// assistant reply is appended only on successful completion of the
    /// stream.
    pub async fn chat(&self, user_id: i64, role_id: i64, text: impl Into<String>) -> Result<ChatStream> {
        let text = text.into();
        let conversation = self.conversations.get_or_create(user_id, role_id)?;
        let conversation_id = conversation.conversation_id.clone();

        // Serialize whole turns per conversation: the guard is acquired
        // before the user append and held (inside the stream) until the
        // assistant append and stats update are durable, or the consumer
        // drops the stream.
        let turn = self.sessions.turn_lock(&conversation_id).lock_owned().await;

        self.sessions
            .append(&conversation_id, Message::user(text))
            .await?;
        let context = self.sessions.context(&conversation_id).await?;
        debug!(
            conversation_id,
            context_len = context.len(),
            "starting model turn"
        );

        let sessions = self.sessions.clone();
        let conversations = self.conversations.clone();
        let llm = self.llm.clone();

        let stream = try_stream! {
            let _turn = turn;
            let mut chunks = llm.complete_stream(CompletionRequest::new(context));
            let mut reply = String::new();
            let mut completed = false;

            while let Some(chunk) = chunks.next().await {
                let chunk = chunk.map_err(|err| {
                    error!(conversation_id = %conversation_id, error = %err, "model stream failed");
                    ChatError::ModelStream(err.to_string())
                })?;

                match chunk {
                    StreamChunk::Delta(delta) => {
                        reply.push_str(&delta);
                        yield ChatEvent::Delta(delta);
                    }
                    StreamChunk::Final {
                        tool_calls, usage, ..
                    } => {
                        let message = if tool_calls.is_empty() {
                            Message::assistant(reply.clone())
                        } else {
                            Message::assistant_with_tool_calls(tool_calls)
                        };
                        sessions.append(&conversation_id, message).await?;

                        let (input, output) = match usage.as_ref() {
                            Some(u) => (Some(u.prompt_tokens), Some(u.completion_tokens)),
                            None => (None, None),
                        };
                        conversations.update_stats(&conversation_id, input, output)?;

                        completed = true;
                        yield ChatEvent::Done {
                            conversation_id: conversation_id.clone(),
                            reply: reply.clone(),
                            usage,
                        };
                        break;
                    }
                }
            }

            if !completed {
                Err(ChatError::ModelStream(
                    "stream ended without a terminal chunk".to_string(),
                ))?;
            }
        };

        Ok(Box::pin(stream))
    }
}
