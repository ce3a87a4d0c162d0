//! LLM module - client contract for the external chat model.
//!
//! The model is stateless from the core's point of view: the full compacted
//! context window is supplied on every call.

mod client;
mod mock;

pub use client::{
    CompletionRequest, CompletionResponse, FinishReason, LlmClient, Message, Role, StreamChunk,
    StreamResult, TokenUsage, ToolCall,
};
pub use mock::{MockLlmClient, MockStep, MockStepKind};
