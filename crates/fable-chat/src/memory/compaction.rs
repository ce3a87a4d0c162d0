//! Read-time context compaction for conversation history.
//!
//! Once a conversation's estimated token count exceeds the budget, aged
//! messages are replaced by a generated digest appended to the system prompt,
//! while a recent tail stays raw. The durable log is never touched; every
//! model read runs the sequence through [`Compactor::compact`] again.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::error::{ChatError, Result};
use crate::llm::{CompletionRequest, LlmClient, Message, Role};

pub const SUMMARY_PROMPT: &str = include_str!("templates/summary_prompt.md");

/// Heading under which the digest is appended to the system prompt.
pub const SUMMARY_HEADING: &str = "Recent conversation summary:";

/// Per-message clip length when building the summarization transcript.
const TRANSCRIPT_CLIP_CHARS: usize = 80;

/// Compaction configuration.
#[derive(Debug, Clone)]
pub struct CompactionConfig {
    /// Whether compaction runs at all.
    pub enabled: bool,
    /// Token budget above which compaction triggers.
    pub max_total_tokens: usize,
    /// Number of recent raw messages kept uncompacted.
    pub recent_raw_count: usize,
    /// Minimum sequence length before compaction is even considered.
    pub min_messages_to_compress: usize,
    /// Cap for the generated digest.
    pub max_summary_tokens: u32,
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_total_tokens: 6_000,
            recent_raw_count: 10,
            min_messages_to_compress: 18,
            max_summary_tokens: 2_000,
        }
    }
}

/// Token estimation for budget checks. Approximate, not billing-accurate.
pub trait Tokenizer: Send + Sync {
    fn estimate(&self, text: &str) -> usize;
}

/// Character-count heuristic: 1 token is roughly 4 characters.
#[derive(Debug, Default)]
pub struct HeuristicTokenizer;

impl Tokenizer for HeuristicTokenizer {
    fn estimate(&self, text: &str) -> usize {
        text.len() / 4 + 1
    }
}

/// External summarization capability, text in / text out.
#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, transcript: &str) -> Result<String>;
}

/// Summarizer backed by an LLM client with a fixed instruction prompt.
pub struct LlmSummarizer {
    llm: Arc<dyn LlmClient>,
    max_summary_tokens: u32,
}

impl LlmSummarizer {
    pub fn new(llm: Arc<dyn LlmClient>, max_summary_tokens: u32) -> Self {
        Self {
            llm,
            max_summary_tokens,
        }
    }
}

#[async_trait]
impl Summarizer for LlmSummarizer {
    async fn summarize(&self, transcript: &str) -> Result<String> {
        let request = CompletionRequest::new(vec![
            Message::system(SUMMARY_PROMPT),
            Message::user(transcript.to_string()),
        ])
        .with_max_tokens(self.max_summary_tokens);

        let response = self
            .llm
            .complete(request)
            .await
            .map_err(|err| ChatError::Summarization(err.to_string()))?;
        Ok(response.content.unwrap_or_default())
    }
}

/// Context compactor applied on every model read.
pub struct Compactor {
    config: CompactionConfig,
    tokenizer: Arc<dyn Tokenizer>,
    summarizer: Arc<dyn Summarizer>,
}

impl Compactor {
    pub fn new(
        config: CompactionConfig,
        tokenizer: Arc<dyn Tokenizer>,
        summarizer: Arc<dyn Summarizer>,
    ) -> Self {
        Self {
            config,
            tokenizer,
            summarizer,
        }
    }

    /// Compactor summarizing through an LLM client, with the digest capped at
    /// the config's `max_summary_tokens`.
    pub fn with_llm(
        config: CompactionConfig,
        tokenizer: Arc<dyn Tokenizer>,
        llm: Arc<dyn LlmClient>,
    ) -> Self {
        let summarizer = Arc::new(LlmSummarizer::new(llm, config.max_summary_tokens));
        Self::new(config, tokenizer, summarizer)
    }

    /// Compact a message sequence, or return it unchanged.
    ///
    /// No-op when compaction is disabled, the sequence is short, the token
    /// estimate fits the budget, or the older window turns out empty after
    /// the recency split. A summarization failure degrades to the uncompacted
    /// sequence for this turn; the next read retries naturally.
    pub async fn compact(&self, messages: Vec<Message>) -> Vec<Message> {
        if !self.config.enabled || messages.len() < self.config.min_messages_to_compress {
            return messages;
        }

        let estimated = self.estimate_total(&messages);
        if estimated <= self.config.max_total_tokens {
            return messages;
        }

        if messages
            .first()
            .map(|m| m.role != Role::System)
            .unwrap_or(true)
        {
            // Without a seed system prompt there is nothing to fold the
            // digest into; leave the sequence alone.
            return messages;
        }

        let recent_count = self.config.recent_raw_count.min(messages.len());
        let mut start = messages.len() - recent_count;
        // An assistant reply must never be separated from the user turn that
        // produced it: extend the tail backward across the boundary.
        if start > 1 && messages[start].role == Role::Assistant {
            start -= 1;
        }
        if start <= 1 {
            // Older window is empty; structurally a no-op.
            return messages;
        }

        let transcript = build_transcript(&messages[1..start]);
        let summary = match self.summarizer.summarize(&transcript).await {
            Ok(summary) => summary,
            Err(err) => {
                warn!(error = %err, "summarization failed, returning uncompacted context");
                return messages;
            }
        };

        let system = Message::system(format!(
            "{}\n\n{}\n{}",
            messages[0].content, SUMMARY_HEADING, summary
        ));

        let mut compacted = Vec::with_capacity(1 + messages.len() - start);
        compacted.push(system);
        compacted.extend_from_slice(&messages[start..]);

        debug!(
            original = messages.len(),
            compacted = compacted.len(),
            estimated_tokens = estimated,
            "compaction applied"
        );
        compacted
    }

    /// Token estimate over text content only; tool payloads are excluded.
    fn estimate_total(&self, messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|m| self.tokenizer.estimate(&m.content))
            .sum()
    }
}

/// Render the older window as a clipped `[USER]`/`[ASSISTANT]` transcript.
fn build_transcript(older: &[Message]) -> String {
    let mut transcript = String::new();
    for message in older {
        let tag = match message.role {
            Role::User => "[USER]",
            Role::Assistant if message.tool_calls.is_none() => "[ASSISTANT]",
            _ => continue,
        };
        transcript.push_str(tag);
        transcript.push_str(&clip(&message.content));
        transcript.push('\n');
    }
    transcript
}

/// Collapse whitespace and clip to the transcript budget.
fn clip(text: &str) -> String {
    let collapsed = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > TRANSCRIPT_CLIP_CHARS {
        let clipped: String = collapsed.chars().take(TRANSCRIPT_CLIP_CHARS).collect();
        format!("{clipped}...")
    } else {
        collapsed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    /// Summarizer that records every transcript it receives.
    #[derive(Default)]
    struct RecordingSummarizer {
        calls: AtomicUsize,
        transcripts: Mutex<Vec<String>>,
        fail: bool,
    }

    impl RecordingSummarizer {
        fn failing() -> Self {
            Self {
                fail: true,
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl Summarizer for RecordingSummarizer {
        async fn summarize(&self, transcript: &str) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.transcripts.lock().await.push(transcript.to_string());
            if self.fail {
                Err(ChatError::Summarization("summary backend down".into()))
            } else {
                Ok("digest of earlier turns".to_string())
            }
        }
    }

    fn compactor_with(
        config: CompactionConfig,
        summarizer: Arc<RecordingSummarizer>,
    ) -> Compactor {
        Compactor::new(config, Arc::new(HeuristicTokenizer), summarizer)
    }

    /// 1 system + `pairs` long user/assistant pairs.
    fn long_conversation(pairs: usize) -> Vec<Message> {
        let mut messages = vec![Message::system("You are a playful travel companion.")];
        for i in 0..pairs {
            messages.push(Message::user(format!("u{i} {}", "question ".repeat(80))));
            messages.push(Message::assistant(format!("a{i} {}", "answer ".repeat(80))));
        }
        messages
    }

    #[tokio::test]
    async fn test_noop_below_min_message_count() {
        let summarizer = Arc::new(RecordingSummarizer::default());
        let compactor = compactor_with(CompactionConfig::default(), summarizer.clone());

        let messages = long_conversation(5); // 11 < 18
        let result = compactor.compact(messages.clone()).await;
        assert_eq!(result, messages);
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_noop_within_token_budget() {
        let summarizer = Arc::new(RecordingSummarizer::default());
        let compactor = compactor_with(CompactionConfig::default(), summarizer.clone());

        let mut messages = vec![Message::system("seed")];
        for i in 0..15 {
            messages.push(Message::user(format!("short {i}")));
            messages.push(Message::assistant(format!("ok {i}")));
        }
        let result = compactor.compact(messages.clone()).await;
        assert_eq!(result, messages);
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_noop_when_disabled() {
        let summarizer = Arc::new(RecordingSummarizer::default());
        let config = CompactionConfig {
            enabled: false,
            ..CompactionConfig::default()
        };
        let compactor = compactor_with(config, summarizer.clone());

        let messages = long_conversation(20);
        let result = compactor.compact(messages.clone()).await;
        assert_eq!(result, messages);
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_triggered_compaction_keeps_system_plus_recent_tail() {
        let summarizer = Arc::new(RecordingSummarizer::default());
        let compactor = compactor_with(CompactionConfig::default(), summarizer.clone());

        // 1 system + 20 pairs = 41 messages, far beyond 6000 estimated tokens.
        let messages = long_conversation(20);
        let result = compactor.compact(messages.clone()).await;

        // [system+summary] + last 10 raw messages.
        assert_eq!(result.len(), 11);
        assert_eq!(result[0].role, Role::System);
        assert!(result[0].content.contains(SUMMARY_HEADING));
        assert!(result[0].content.contains("digest of earlier turns"));
        assert!(result[0].content.starts_with("You are a playful travel companion."));
        assert_eq!(result[1..], messages[31..]);

        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);
        let transcripts = summarizer.transcripts.lock().await;
        // Transcript covers the older window only (messages 2..=31), clipped.
        assert!(transcripts[0].starts_with("[USER]u0 "));
        assert!(transcripts[0].contains("[ASSISTANT]a14 "));
        assert!(!transcripts[0].contains("u15 "));
        for line in transcripts[0].lines() {
            assert!(line.chars().count() <= "[ASSISTANT]".len() + 83);
        }
    }

    #[tokio::test]
    async fn test_assistant_boundary_extends_tail_backward() {
        let summarizer = Arc::new(RecordingSummarizer::default());
        let config = CompactionConfig {
            recent_raw_count: 9,
            ..CompactionConfig::default()
        };
        let compactor = compactor_with(config, summarizer.clone());

        let messages = long_conversation(20);
        // Cut at index 32 lands on an assistant reply; the tail must extend
        // one position back so the pair stays together.
        let result = compactor.compact(messages.clone()).await;
        assert_eq!(result.len(), 11);
        assert_eq!(result[1].role, Role::User);
        assert_eq!(result[1..], messages[31..]);
    }

    #[tokio::test]
    async fn test_summarization_failure_degrades_to_uncompacted() {
        let summarizer = Arc::new(RecordingSummarizer::failing());
        let compactor = compactor_with(CompactionConfig::default(), summarizer.clone());

        let messages = long_conversation(20);
        let result = compactor.compact(messages.clone()).await;
        assert_eq!(result, messages);
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_older_window_skips_summarization() {
        let summarizer = Arc::new(RecordingSummarizer::default());
        let config = CompactionConfig {
            min_messages_to_compress: 4,
            recent_raw_count: 10,
            max_total_tokens: 10,
            ..CompactionConfig::default()
        };
        let compactor = compactor_with(config, summarizer.clone());

        // Just over the trigger threshold: the whole history fits inside the
        // recent tail, so there is nothing to summarize.
        let messages = long_conversation(3);
        let result = compactor.compact(messages.clone()).await;
        assert_eq!(result, messages);
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_with_llm_summarizes_through_client() {
        use crate::llm::{MockLlmClient, MockStep};

        let llm = Arc::new(MockLlmClient::new(vec![MockStep::text(
            "digest from the model",
        )]));
        let compactor = Compactor::with_llm(
            CompactionConfig::default(),
            Arc::new(HeuristicTokenizer),
            llm,
        );

        let result = compactor.compact(long_conversation(20)).await;
        assert_eq!(result.len(), 11);
        assert!(result[0].content.contains("digest from the model"));
    }

    #[tokio::test]
    async fn test_llm_summarizer_returns_completion_text() {
        use crate::llm::{MockLlmClient, MockStep};

        let llm = Arc::new(MockLlmClient::new(vec![MockStep::text(
            "two friends planned a coastal trip",
        )]));
        let summarizer = LlmSummarizer::new(llm, 2_000);

        let digest = summarizer
            .summarize("[USER]where to?\n[ASSISTANT]the coast\n")
            .await
            .unwrap();
        assert_eq!(digest, "two friends planned a coastal trip");
    }

    #[test]
    fn test_clip_collapses_whitespace_and_truncates() {
        let clipped = clip("  a   lot \n of\t whitespace  ");
        assert_eq!(clipped, "a lot of whitespace");

        let long = "x".repeat(200);
        let clipped = clip(&long);
        assert_eq!(clipped.chars().count(), 83);
        assert!(clipped.ends_with("..."));
    }
}
