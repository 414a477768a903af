//! Conversation history: buffer, dated log persistence, and compression.
//!
//! Every turn pushed onto a [`ConversationBuffer`] is appended to
//! `<logs_dir>/YYYY-MM-DD.md`, which is what hybrid search scans for log
//! matches. When the buffer's estimated size passes
//! `trigger_ratio × token_threshold`, [`HistoryCompressor`] replaces the
//! oldest `window_turns` turns with a single system turn holding their
//! summary.

use async_trait::async_trait;
use chrono::{Local, NaiveDate};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::collaborator::{Collaborator, ResponseFormat};
use crate::config::HistoryConfig;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    pub content: String,
}

impl Turn {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Appends turns to one markdown file per day.
#[derive(Debug, Clone)]
pub struct ConversationLog {
    dir: PathBuf,
}

impl ConversationLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, date: NaiveDate) -> PathBuf {
        self.dir.join(format!("{}.md", date.format("%Y-%m-%d")))
    }

    pub async fn append(&self, session_id: &Uuid, turn: &Turn) -> Result<PathBuf> {
        let now = Local::now();
        let path = self.path_for(now.date_naive());
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| Error::io(&self.dir, e))?;

        let entry = format!(
            "## {} {} ({})\n\n{}\n\n",
            now.format("%H:%M:%S"),
            turn.role.as_str(),
            session_id,
            turn.content.trim_end()
        );

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| Error::io(&path, e))?;
        file.write_all(entry.as_bytes())
            .await
            .map_err(|e| Error::io(&path, e))?;
        file.flush().await.map_err(|e| Error::io(&path, e))?;
        Ok(path)
    }
}

/// Ordered turns of one session.
#[derive(Debug)]
pub struct ConversationBuffer {
    session_id: Uuid,
    turns: Vec<Turn>,
    log: Option<ConversationLog>,
}

impl ConversationBuffer {
    pub fn new(log: Option<ConversationLog>) -> Self {
        Self {
            session_id: Uuid::new_v4(),
            turns: Vec::new(),
            log,
        }
    }

    pub fn session_id(&self) -> &Uuid {
        &self.session_id
    }

    pub fn turns(&self) -> &[Turn] {
        &self.turns
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Append a turn and persist it to the day's log. The turn stays in the
    /// buffer even if the log write fails.
    pub async fn push(&mut self, role: Role, content: impl Into<String>) -> Result<()> {
        let turn = Turn::new(role, content);
        self.turns.push(turn.clone());
        if let Some(log) = &self.log {
            log.append(&self.session_id, &turn).await?;
        }
        Ok(())
    }

    /// Replace the first `n` turns with one system turn.
    fn replace_prefix(&mut self, n: usize, summary: String) {
        let n = n.min(self.turns.len());
        let mut turns = Vec::with_capacity(self.turns.len() - n + 1);
        turns.push(Turn::new(Role::System, summary));
        turns.extend(self.turns.drain(n..));
        self.turns = turns;
    }
}

#[async_trait]
pub trait TokenCounter: Send + Sync {
    async fn count(&self, turns: &[Turn]) -> Result<usize>;
}

#[async_trait]
pub trait Summarizer: Send + Sync {
    async fn summarize(&self, turns: &[Turn]) -> Result<String>;
}

/// Summarizes through the language-model collaborator.
pub struct CollaboratorSummarizer {
    collaborator: Arc<dyn Collaborator>,
}

impl CollaboratorSummarizer {
    pub fn new(collaborator: Arc<dyn Collaborator>) -> Self {
        Self { collaborator }
    }
}

#[async_trait]
impl Summarizer for CollaboratorSummarizer {
    async fn summarize(&self, turns: &[Turn]) -> Result<String> {
        let transcript: String = turns
            .iter()
            .map(|t| format!("{}: {}\n", t.role.as_str(), t.content))
            .collect();
        let prompt = format!(
            "Summarize this conversation excerpt. Keep facts, decisions, and open \
             tasks; drop small talk.\n\n{}",
            transcript
        );
        let summary = self
            .collaborator
            .complete(&prompt, ResponseFormat::Text)
            .await?;
        if summary.trim().is_empty() {
            return Err(Error::Decode("empty summary".into()));
        }
        Ok(summary)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Compression {
    NotNeeded { tokens: usize },
    Compressed { removed_turns: usize, tokens_before: usize },
}

pub struct HistoryCompressor {
    config: HistoryConfig,
    counter: Option<Arc<dyn TokenCounter>>,
    summarizer: Arc<dyn Summarizer>,
}

impl HistoryCompressor {
    pub fn new(config: HistoryConfig, summarizer: Arc<dyn Summarizer>) -> Self {
        Self {
            config,
            counter: None,
            summarizer,
        }
    }

    pub fn with_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.counter = Some(counter);
        self
    }

    /// Token count above which compression kicks in.
    pub fn trigger_tokens(&self) -> usize {
        (self.config.token_threshold as f64 * self.config.trigger_ratio) as usize
    }

    /// Counter result when available, otherwise `chars × fallback_tokens_per_char`.
    pub async fn estimate_tokens(&self, turns: &[Turn]) -> usize {
        if let Some(counter) = &self.counter {
            match counter.count(turns).await {
                Ok(n) => return n,
                Err(e) => warn!(error = %e, "token counter failed, using character estimate"),
            }
        }
        let chars: usize = turns.iter().map(|t| t.content.chars().count()).sum();
        chars.saturating_mul(self.config.fallback_tokens_per_char)
    }

    /// Compress `buffer` if it is over budget. On summarizer failure the
    /// buffer is left exactly as it was and the error is returned.
    pub async fn maybe_compress(&self, buffer: &mut ConversationBuffer) -> Result<Compression> {
        let tokens = self.estimate_tokens(buffer.turns()).await;
        if tokens <= self.trigger_tokens() || buffer.len() < 2 {
            debug!(tokens, trigger = self.trigger_tokens(), "history within budget");
            return Ok(Compression::NotNeeded { tokens });
        }

        let window = self.config.window_turns.clamp(1, buffer.len());
        let summary = self.summarizer.summarize(&buffer.turns()[..window]).await?;
        buffer.replace_prefix(window, summary);

        info!(
            session = %buffer.session_id(),
            removed = window,
            tokens_before = tokens,
            remaining = buffer.len(),
            "compressed conversation history"
        );
        Ok(Compression::Compressed {
            removed_turns: window,
            tokens_before: tokens,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FixedSummarizer {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Summarizer for FixedSummarizer {
        async fn summarize(&self, turns: &[Turn]) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(format!("summary of {} turns", turns.len()))
        }
    }

    struct FailingSummarizer;

    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _turns: &[Turn]) -> Result<String> {
            Err(Error::Collaborator("unreachable".into()))
        }
    }

    struct BrokenCounter;

    #[async_trait]
    impl TokenCounter for BrokenCounter {
        async fn count(&self, _turns: &[Turn]) -> Result<usize> {
            Err(Error::Collaborator("no tokenizer".into()))
        }
    }

    fn small_budget() -> HistoryConfig {
        HistoryConfig {
            token_threshold: 100,
            trigger_ratio: 0.8,
            window_turns: 3,
            fallback_tokens_per_char: 4,
        }
    }

    async fn buffer_with(turns: usize, chars: usize) -> ConversationBuffer {
        let mut buffer = ConversationBuffer::new(None);
        for i in 0..turns {
            let role = if i % 2 == 0 { Role::User } else { Role::Assistant };
            buffer.push(role, "x".repeat(chars)).await.unwrap();
        }
        buffer
    }

    #[tokio::test]
    async fn test_compresses_oldest_window() {
        let summarizer = Arc::new(FixedSummarizer {
            calls: AtomicUsize::new(0),
        });
        let compressor = HistoryCompressor::new(small_budget(), summarizer.clone());
        // 5 turns × 5 chars × 4 = 100 tokens > 80.
        let mut buffer = buffer_with(5, 5).await;
        let last = buffer.turns()[4].clone();

        let result = compressor.maybe_compress(&mut buffer).await.unwrap();
        assert_eq!(
            result,
            Compression::Compressed {
                removed_turns: 3,
                tokens_before: 100
            }
        );
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.turns()[0].role, Role::System);
        assert_eq!(buffer.turns()[0].content, "summary of 3 turns");
        assert_eq!(buffer.turns()[2], last);
        assert_eq!(summarizer.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_under_budget_untouched() {
        let compressor = HistoryCompressor::new(small_budget(), Arc::new(FailingSummarizer));
        // 4 turns × 5 chars × 4 = 80 tokens, not above the 80 trigger.
        let mut buffer = buffer_with(4, 5).await;
        let result = compressor.maybe_compress(&mut buffer).await.unwrap();
        assert_eq!(result, Compression::NotNeeded { tokens: 80 });
        assert_eq!(buffer.len(), 4);
    }

    #[tokio::test]
    async fn test_failed_summary_leaves_buffer() {
        let compressor = HistoryCompressor::new(small_budget(), Arc::new(FailingSummarizer));
        let mut buffer = buffer_with(6, 10).await;
        let before = buffer.turns().to_vec();
        assert!(compressor.maybe_compress(&mut buffer).await.is_err());
        assert_eq!(buffer.turns(), &before[..]);
    }

    #[tokio::test]
    async fn test_broken_counter_falls_back_to_chars() {
        let compressor = HistoryCompressor::new(small_budget(), Arc::new(FailingSummarizer))
            .with_counter(Arc::new(BrokenCounter));
        let turns = vec![Turn::new(Role::User, "abc")];
        assert_eq!(compressor.estimate_tokens(&turns).await, 12);
    }

    #[tokio::test]
    async fn test_push_appends_to_dated_log() {
        let dir = tempfile::tempdir().unwrap();
        let log = ConversationLog::new(dir.path().join("logs"));
        let mut buffer = ConversationBuffer::new(Some(log.clone()));
        buffer.push(Role::User, "Where is the invoice?").await.unwrap();
        buffer.push(Role::Assistant, "In the finance folder.").await.unwrap();

        let path = log.path_for(Local::now().date_naive());
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("user"));
        assert!(text.contains("Where is the invoice?"));
        assert!(text.contains("In the finance folder."));
        assert!(text.contains(&buffer.session_id().to_string()));
        assert_eq!(std::fs::read_dir(dir.path().join("logs")).unwrap().count(), 1);
    }

    #[test]
    fn test_log_path_is_dated() {
        let log = ConversationLog::new("/mem/logs");
        let date = NaiveDate::from_ymd_opt(2024, 5, 1).unwrap();
        assert_eq!(log.path_for(date), PathBuf::from("/mem/logs/2024-05-01.md"));
    }
}
