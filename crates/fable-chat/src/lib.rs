//! Fable Chat - conversation memory core for a role-playing companion chat
//! backend.
//!
//! This crate provides:
//! - Durable message codec (records <-> typed messages, retrieval-injection
//!   split, tool payload serialization)
//! - Working memory with a keyed session registry (one live window per
//!   conversation, write-through to the chat log)
//! - Read-time context compaction (aged history folded into a digest under a
//!   token budget)
//! - Conversation lifecycle (one conversation per `(user, role)` pair, reset,
//!   statistics)
//! - Streaming chat turn orchestration over an `LlmClient` contract
//!
//! Transport, authentication, retrieval ingestion and role configuration stay
//! outside; they talk to this crate through the traits defined here.

pub mod conversation;
pub mod error;
pub mod llm;
pub mod memory;
pub mod service;

pub use conversation::{
    Conversation, ConversationManager, IdProvider, RoleProvider, UuidIds,
};
pub use error::{ChatError, Result};
pub use llm::{
    CompletionRequest, CompletionResponse, FinishReason, LlmClient, Message, MockLlmClient,
    MockStep, MockStepKind, Role, StreamChunk, StreamResult, TokenUsage, ToolCall,
};
pub use memory::{
    ChatRecord, CompactionConfig, Compactor, DEFAULT_CONTEXT_WINDOW, HeuristicTokenizer,
    INJECT_MARKER, LlmSummarizer, SessionManager, Summarizer, Tokenizer, WorkingMemory,
};
pub use service::{ChatEvent, ChatService, ChatStream};
