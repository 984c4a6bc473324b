//! Outbound text accumulation and rate-limited flushing.
//!
//! Incremental deltas append to an accumulation buffer; `flush` materializes
//! the unsent remainder into the thread, editing one "live" message in place
//! and rolling over to a fresh message when the platform size limit is hit.
//! Chunk boundaries never land inside a code fence.

use std::sync::Arc;
use std::time::Instant;

use agent_relay_error::RelayError;

use crate::chat::{ChatClient, MessageRef, ThreadId};

const FENCE: &str = "```";

/// One outbound chunk: `text` is what gets sent (possibly with a synthetic
/// fence close/reopen), `consumed` is how many input bytes it covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    pub text: String,
    pub consumed: usize,
}

/// Split `text` into chunks of at most `limit` characters, breaking at the
/// last newline before the limit and closing/reopening code fences across
/// the break.
pub fn split_message(text: &str, limit: usize) -> Vec<Chunk> {
    assert!(limit > FENCE.len() * 2 + 2, "limit too small to split");
    let mut chunks = Vec::new();
    let mut rest = text;
    let mut open_fence: Option<String> = None;

    while !rest.is_empty() {
        let prefix = open_fence
            .as_deref()
            .map(|fence| format!("{fence}\n"))
            .unwrap_or_default();
        let reserve = if count_fences(rest) % 2 == 1 || open_fence.is_some() {
            FENCE.len() + 1
        } else {
            0
        };
        let budget = limit.saturating_sub(prefix.len() + reserve);

        if rest.len() + prefix.len() <= limit {
            chunks.push(Chunk {
                text: format!("{prefix}{rest}"),
                consumed: rest.len(),
            });
            break;
        }

        let mut cut = cut_point(rest, budget);
        if cut == 0 {
            // Degenerate budget (a fence reopen line near the limit). Take
            // one char so the loop always advances, even if the chunk
            // slightly overruns the limit.
            cut = rest
                .chars()
                .next()
                .map(char::len_utf8)
                .unwrap_or(rest.len());
        }
        let (head, tail) = rest.split_at(cut);
        let fences_in_head = count_fences(head);
        let fence_open_after = match &open_fence {
            Some(_) => fences_in_head % 2 == 0,
            None => fences_in_head % 2 == 1,
        };
        let mut body = format!("{prefix}{}", head.trim_end_matches('\n'));
        if fence_open_after {
            body.push('\n');
            body.push_str(FENCE);
            open_fence = Some(fence_line(head, open_fence.as_deref()));
        } else {
            open_fence = None;
        }
        chunks.push(Chunk {
            text: body,
            consumed: cut,
        });
        rest = tail;
    }
    chunks
}

fn cut_point(text: &str, budget: usize) -> usize {
    let mut end = budget.min(text.len());
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    match text[..end].rfind('\n') {
        Some(pos) if pos > 0 => pos + 1,
        _ => end,
    }
}

fn count_fences(text: &str) -> usize {
    text.lines()
        .filter(|line| line.trim_start().starts_with(FENCE))
        .count()
}

/// The fence line to reopen in the next chunk, preserving the language tag.
fn fence_line(head: &str, inherited: Option<&str>) -> String {
    head.lines()
        .filter(|line| line.trim_start().starts_with(FENCE))
        .last()
        .map(|line| line.trim().to_string())
        .or_else(|| inherited.map(str::to_string))
        .unwrap_or_else(|| FENCE.to_string())
}

/// UI-facing accumulation state for one run.
pub struct StreamUi {
    chat: Arc<dyn ChatClient>,
    thread_id: ThreadId,
    /// Full assistant text for the current turn, flushed or not.
    accumulated: String,
    /// Bytes of `accumulated` already finalized into non-live messages.
    finalized_len: usize,
    live_message: Option<MessageRef>,
    /// What the live message currently shows, to skip no-op edits.
    live_content: String,
    status_message: Option<MessageRef>,
    pub last_flush: Instant,
    pub dirty: bool,
}

impl StreamUi {
    pub fn new(chat: Arc<dyn ChatClient>, thread_id: ThreadId) -> Self {
        Self {
            chat,
            thread_id,
            accumulated: String::new(),
            finalized_len: 0,
            live_message: None,
            live_content: String::new(),
            status_message: None,
            last_flush: Instant::now(),
            dirty: false,
        }
    }

    pub fn append(&mut self, delta: &str) {
        self.accumulated.push_str(delta);
        self.dirty = true;
    }

    pub fn accumulated(&self) -> &str {
        &self.accumulated
    }

    /// Adopt the authoritative full-turn text. Deltas are only a display
    /// preview; the full message wins unless adopting it would require
    /// rewriting text already finalized into earlier messages.
    pub fn reconcile(&mut self, full_text: &str) {
        if full_text == self.accumulated {
            return;
        }
        if full_text.len() >= self.finalized_len
            && full_text.as_bytes()[..self.finalized_len]
                == self.accumulated.as_bytes()[..self.finalized_len]
        {
            self.accumulated = full_text.to_string();
            self.dirty = true;
        } else {
            tracing::warn!(
                thread_id = %self.thread_id,
                "full turn text diverged from finalized prefix; keeping streamed text"
            );
        }
    }

    /// Materialize unsent text. Transient delivery errors leave the current
    /// state as best-effort latest; a deleted live message is transparently
    /// replaced.
    pub async fn flush(&mut self) -> Result<(), RelayError> {
        if !self.dirty {
            return Ok(());
        }
        let remainder = self.accumulated[self.finalized_len..].to_string();
        if remainder.is_empty() || remainder == self.live_content {
            self.dirty = false;
            return Ok(());
        }
        let limit = self.chat.message_limit();
        let chunks = split_message(&remainder, limit);
        let total = chunks.len();
        for (i, chunk) in chunks.into_iter().enumerate() {
            let is_last = i + 1 == total;
            let delivered = match self.live_message {
                Some(message) => {
                    match self
                        .chat
                        .edit_text(&self.thread_id, message, &chunk.text)
                        .await
                    {
                        Ok(()) => true,
                        Err(err) if err.is_message_deleted() => {
                            self.live_message = None;
                            self.send_live(&chunk.text).await?
                        }
                        Err(err) => {
                            tracing::debug!(error = %err, "transient edit failure, retrying on next flush");
                            // Stamp the attempt so the retry waits out a
                            // full flush interval instead of spinning.
                            self.last_flush = Instant::now();
                            return Ok(());
                        }
                    }
                }
                None => {
                    // The first visible text of a turn replaces the status
                    // indicator.
                    self.clear_status().await;
                    self.send_live(&chunk.text).await?
                }
            };
            if !delivered {
                self.last_flush = Instant::now();
                return Ok(());
            }
            self.live_content = chunk.text.clone();
            if !is_last {
                self.finalized_len += chunk.consumed;
                self.live_message = None;
                self.live_content.clear();
            }
        }
        self.dirty = false;
        self.last_flush = Instant::now();
        Ok(())
    }

    async fn send_live(&mut self, text: &str) -> Result<bool, RelayError> {
        match self.chat.send_text(&self.thread_id, text).await {
            Ok(message) => {
                self.live_message = Some(message);
                Ok(true)
            }
            Err(err) => {
                tracing::debug!(error = %err, "transient send failure, retrying on next flush");
                Ok(false)
            }
        }
    }

    /// End-of-turn: the live message is final; the next turn starts a new
    /// one.
    pub async fn finish_turn(&mut self) -> Result<(), RelayError> {
        self.flush().await?;
        self.accumulated.clear();
        self.finalized_len = 0;
        self.live_message = None;
        self.live_content.clear();
        Ok(())
    }

    pub fn turn_has_text(&self) -> bool {
        !self.accumulated.is_empty()
    }

    pub async fn set_status(&mut self, text: &str) {
        match self.status_message {
            Some(message) => {
                if let Err(err) = self.chat.edit_text(&self.thread_id, message, text).await {
                    if err.is_message_deleted() {
                        self.status_message = self.chat.send_text(&self.thread_id, text).await.ok();
                    }
                }
            }
            None => {
                self.status_message = self.chat.send_text(&self.thread_id, text).await.ok();
            }
        }
    }

    pub async fn clear_status(&mut self) {
        if let Some(message) = self.status_message.take() {
            let _ = self.chat.delete_message(&self.thread_id, message).await;
        }
    }
}
