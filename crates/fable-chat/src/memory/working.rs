//! Working memory - the live, bounded message sequence for one conversation.
//!
//! A read-through/write-through cache in front of the durable log: holds at
//! most `max_raw` conversational messages plus the leading system message,
//! which is never evicted. Compaction is a separate read-time transformation;
//! eviction here only bounds the in-memory window.

use std::collections::VecDeque;

use crate::llm::{Message, Role};

/// Default per-conversation in-memory cap.
pub const DEFAULT_CONTEXT_WINDOW: usize = 20;

/// Bounded message window for a single conversation.
#[derive(Debug, Clone)]
pub struct WorkingMemory {
    messages: VecDeque<Message>,
    max_raw: usize,
}

impl WorkingMemory {
    /// Create an empty working memory bounded to `max_raw` conversational
    /// messages (the leading system message does not count against the cap).
    pub fn new(max_raw: usize) -> Self {
        Self {
            messages: VecDeque::with_capacity(max_raw + 1),
            max_raw: max_raw.max(1),
        }
    }

    /// Hydrate from a decoded history: the leading system message (if any)
    /// plus the last `max_raw` messages of the remainder.
    pub fn from_history(history: Vec<Message>, max_raw: usize) -> Self {
        let mut memory = Self::new(max_raw);
        let mut rest = history;

        if rest.first().map(|m| m.role == Role::System).unwrap_or(false) {
            memory.messages.push_back(rest.remove(0));
        }

        let start = rest.len().saturating_sub(memory.max_raw);
        memory.messages.extend(rest.into_iter().skip(start));
        memory
    }

    /// Append a message, evicting the oldest non-system message when the
    /// window is full.
    pub fn push(&mut self, message: Message) {
        let cap = self.max_raw + usize::from(self.has_leading_system());
        while self.messages.len() >= cap {
            let idx = self
                .messages
                .iter()
                .position(|m| m.role != Role::System);
            match idx {
                Some(idx) => {
                    self.messages.remove(idx);
                }
                None => break,
            }
        }
        self.messages.push_back(message);
    }

    /// Snapshot of the current sequence, oldest first.
    pub fn messages(&self) -> Vec<Message> {
        self.messages.iter().cloned().collect()
    }

    /// Clear everything except the leading system message.
    ///
    /// This is the conversation "reset": the durable log is untouched, only
    /// the live window collapses back to the seed prompt.
    pub fn reset(&mut self) {
        let system = self
            .messages
            .front()
            .filter(|m| m.role == Role::System)
            .cloned();
        self.messages.clear();
        if let Some(system) = system {
            self.messages.push_back(system);
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn max_raw(&self) -> usize {
        self.max_raw
    }

    fn has_leading_system(&self) -> bool {
        self.messages
            .front()
            .map(|m| m.role == Role::System)
            .unwrap_or(false)
    }
}
