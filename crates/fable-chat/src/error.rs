//! Error types for the chat core.

use thiserror::Error;

/// Chat core error types.
///
/// Store and ordering-integrity errors are fatal for the current turn and
/// bubble to the caller. Summarization failures are degradable and are
/// absorbed with a logged fallback on the compaction path.
#[derive(Error, Debug)]
pub enum ChatError {
    #[error("storage error: {0}")]
    Store(#[from] anyhow::Error),

    #[error("unknown message kind for role '{role}': {detail}")]
    UnknownMessageKind { role: String, detail: String },

    #[error("summarization failed: {0}")]
    Summarization(String),

    #[error("LLM error: {0}")]
    Llm(String),

    #[error("model stream error: {0}")]
    ModelStream(String),

    #[error("role not found: {0}")]
    RoleNotFound(i64),

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type alias for chat core operations.
pub type Result<T> = std::result::Result<T, ChatError>;
