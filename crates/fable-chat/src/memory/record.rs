//! Persisted chat record and the codec between records and typed messages.
//!
//! Records are the durable shape of a message: role plus exactly one of
//! conversational content, a serialized tool-call list, or a serialized tool
//! result. User turns that were augmented with retrieved reference material
//! additionally carry the full augmented string in `enhanced_content`; the
//! original user text is always recoverable as the substring strictly after
//! the injection marker.

use serde::{Deserialize, Serialize};

use crate::error::{ChatError, Result};
use crate::llm::{Message, Role, ToolCall};

/// Fixed delimiter separating original user text from injected retrieval
/// content inside an augmented message. Shared with the retrieval layer.
pub const INJECT_MARKER: &str =
    "\n[Reference material]\nThe following retrieved content may help answer:\n";

/// Durable representation of one message in a conversation's log.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatRecord {
    pub conversation_id: String,
    pub role: Role,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Retrieval-augmented superset actually shown to the model, when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enhanced_content: Option<String>,
    /// JSON-serialized `Vec<ToolCall>`, assistant tool-invocation turns only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<String>,
    /// JSON-serialized `ToolResultPayload`, tool-role turns only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_result: Option<String>,
    /// Append-time timestamp in epoch milliseconds. Log order is defined by
    /// the store's sequence numbers; this is informational.
    pub created_at: i64,
}

/// Serialized body of a tool-result record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolResultPayload {
    pub id: String,
    pub tool_name: String,
    pub text: String,
}

/// True when the content carries injected retrieval material.
pub fn is_enhanced(content: &str) -> bool {
    content.contains(INJECT_MARKER)
}

/// Recover the original user text from a possibly-augmented string: the
/// substring strictly after the marker, or the input itself when no marker
/// is present.
pub fn extract_origin(content: &str) -> &str {
    match content.find(INJECT_MARKER) {
        Some(i) => &content[i + INJECT_MARKER.len()..],
        None => content,
    }
}

impl ChatRecord {
    /// Encode a typed message into its durable record.
    pub fn encode(conversation_id: &str, message: &Message, created_at: i64) -> Result<Self> {
        let mut record = Self {
            conversation_id: conversation_id.to_string(),
            role: message.role,
            content: None,
            enhanced_content: None,
            tool_calls: None,
            tool_result: None,
            created_at,
        };

        match message.role {
            Role::System => {
                record.content = Some(message.content.clone());
            }
            Role::User => {
                if is_enhanced(&message.content) {
                    record.enhanced_content = Some(message.content.clone());
                    record.content = Some(extract_origin(&message.content).to_string());
                } else {
                    record.content = Some(message.content.clone());
                }
            }
            Role::Assistant => match &message.tool_calls {
                Some(calls) => {
                    record.tool_calls = Some(serde_json::to_string(calls)?);
                }
                None => {
                    record.content = Some(message.content.clone());
                }
            },
            Role::Tool => {
                let payload = ToolResultPayload {
                    id: message.tool_call_id.clone().unwrap_or_default(),
                    tool_name: message.name.clone().unwrap_or_default(),
                    text: message.content.clone(),
                };
                record.tool_result = Some(serde_json::to_string(&payload)?);
            }
        }

        Ok(record)
    }

    /// Decode a durable record back into a typed message.
    ///
    /// For user turns the enhanced content is preferred: the model should see
    /// the retrieval-augmented version. An unmapped shape is a hard error -
    /// silently dropping a record would silently corrupt conversation order.
    pub fn decode(&self) -> Result<Message> {
        match self.role {
            Role::System => match &self.content {
                Some(content) => Ok(Message::system(content.clone())),
                None => Err(self.unknown_kind("system record without content")),
            },
            Role::User => {
                let content = self
                    .enhanced_content
                    .as_ref()
                    .filter(|c| !c.is_empty())
                    .or(self.content.as_ref());
                match content {
                    Some(content) => Ok(Message::user(content.clone())),
                    None => Err(self.unknown_kind("user record without content")),
                }
            }
            Role::Assistant => {
                if let Some(raw) = &self.tool_calls {
                    let calls: Vec<ToolCall> = serde_json::from_str(raw)?;
                    Ok(Message::assistant_with_tool_calls(calls))
                } else {
                    match &self.content {
                        Some(content) => Ok(Message::assistant(content.clone())),
                        None => Err(self.unknown_kind("assistant record without content")),
                    }
                }
            }
            Role::Tool => match &self.tool_result {
                Some(raw) => {
                    let payload: ToolResultPayload = serde_json::from_str(raw)?;
                    Ok(Message::tool_result(
                        payload.id,
                        payload.tool_name,
                        payload.text,
                    ))
                }
                None => Err(self.unknown_kind("tool record without result payload")),
            },
        }
    }

    /// True for records holding tool mechanics rather than conversation.
    pub fn is_tool_traffic(&self) -> bool {
        self.tool_calls.is_some() || self.tool_result.is_some()
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(data)?)
    }

    fn unknown_kind(&self, detail: &str) -> ChatError {
        ChatError::UnknownMessageKind {
            role: format!("{:?}", self.role).to_lowercase(),
            detail: detail.to_string(),
        }
    }
}
