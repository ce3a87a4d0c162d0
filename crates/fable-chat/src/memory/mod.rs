//! Conversation memory system.
//!
//! - **Record/codec**: durable message records and their mapping to typed
//!   messages (injection-marker split, tool payload serialization).
//! - **Working memory**: bounded live window per conversation.
//! - **Compaction**: read-time replacement of aged history with a digest.
//! - **Session manager**: the keyed registry owning every live window,
//!   write-through to the chat log.

pub mod compaction;
pub mod record;
pub mod session;
pub mod working;

pub use compaction::{
    CompactionConfig, Compactor, HeuristicTokenizer, LlmSummarizer, SUMMARY_HEADING, Summarizer,
    Tokenizer,
};
pub use record::{ChatRecord, INJECT_MARKER, ToolResultPayload, extract_origin, is_enhanced};
pub use session::SessionManager;
pub use working::{DEFAULT_CONTEXT_WINDOW, WorkingMemory};
