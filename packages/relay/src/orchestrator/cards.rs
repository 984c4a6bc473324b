//! Tool-call cards: one embed per tool invocation, created when the
//! invocation block opens, updated as arguments stream in, and finalized
//! when the result arrives. Cards are keyed by `call_id`, so replayed
//! lifecycle events update in place instead of duplicating.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use crate::chat::{ChatClient, Embed, MessageRef, ThreadId};
use crate::events::detail_from_input;

const RUNNING_COLOR: u32 = 0x5865F2;
const DONE_COLOR: u32 = 0x57F287;
const ERROR_COLOR: u32 = 0xED4245;

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CardStatus {
    Running,
    Done,
    Error,
}

/// File modification captured from an edit/write tool's arguments, rendered
/// as a compact diff on the finished card.
#[derive(Debug, Clone)]
struct FileChange {
    path: String,
    removed: Option<String>,
    added: String,
}

struct ToolCard {
    name: String,
    detail: Option<String>,
    status: CardStatus,
    message: Option<MessageRef>,
    started: Instant,
    change: Option<FileChange>,
    /// Diff cards survive the end-of-turn sweep; plain cards are ephemeral.
    persistent: bool,
}

struct PartialInput {
    call_id: String,
    name: String,
    buffer: String,
}

/// Per-run card state. Owned by the run driver; the permission gate reaches
/// it through a shared mutex to sweep before a blocking prompt renders.
pub struct CardTracker {
    chat: Arc<dyn ChatClient>,
    thread_id: ThreadId,
    cards: HashMap<String, ToolCard>,
    /// Insertion order, for the sweep and the status summary.
    order: Vec<String>,
    partial_inputs: HashMap<usize, PartialInput>,
    /// Tool names invoked this turn, in order.
    turn_log: Vec<String>,
    /// Files written or edited this turn; scanned for image delivery.
    touched_paths: Vec<PathBuf>,
    delivered_images: HashSet<PathBuf>,
    tail_chars: usize,
}

impl CardTracker {
    pub fn new(chat: Arc<dyn ChatClient>, thread_id: ThreadId, tail_chars: usize) -> Self {
        Self {
            chat,
            thread_id,
            cards: HashMap::new(),
            order: Vec::new(),
            partial_inputs: HashMap::new(),
            turn_log: Vec::new(),
            touched_paths: Vec::new(),
            delivered_images: HashSet::new(),
            tail_chars,
        }
    }

    /// Open a card for a tool invocation. Idempotent per `call_id`.
    pub async fn open(&mut self, index: usize, call_id: &str, name: &str) {
        self.partial_inputs.insert(
            index,
            PartialInput {
                call_id: call_id.to_string(),
                name: name.to_string(),
                buffer: String::new(),
            },
        );
        if self.cards.contains_key(call_id) {
            return;
        }
        self.turn_log.push(name.to_string());
        let mut card = ToolCard {
            name: name.to_string(),
            detail: None,
            status: CardStatus::Running,
            message: None,
            started: Instant::now(),
            change: None,
            persistent: false,
        };
        card.message = self
            .chat
            .send_embed(&self.thread_id, &render(&card), &[])
            .await
            .ok();
        self.cards.insert(call_id.to_string(), card);
        self.order.push(call_id.to_string());
    }

    /// Register a card with no open streaming block: a gate callback, or a
    /// lifecycle event that arrived out of order. No message is sent here;
    /// the caller renders whatever state it has.
    fn insert_card(&mut self, call_id: &str, name: &str) {
        self.turn_log.push(name.to_string());
        self.cards.insert(
            call_id.to_string(),
            ToolCard {
                name: name.to_string(),
                detail: None,
                status: CardStatus::Running,
                message: None,
                started: Instant::now(),
                change: None,
                persistent: false,
            },
        );
        self.order.push(call_id.to_string());
    }

    /// Upsert a card from the permission gate, which sees the complete tool
    /// input before (or instead of) the streaming block events. Converges
    /// with `open` on the same `call_id`.
    pub async fn open_call(&mut self, call_id: &str, name: &str, input: Option<&Value>) {
        if !self.cards.contains_key(call_id) {
            self.insert_card(call_id, name);
        }
        let card = match self.cards.get_mut(call_id) {
            Some(card) => card,
            None => return,
        };
        if card.detail.is_none() {
            card.detail = input.and_then(|input| detail_from_input(name, input));
        }
        if card.change.is_none() {
            if let Some(change) = input.and_then(|input| file_change(name, input)) {
                self.touched_paths.push(PathBuf::from(&change.path));
                card.change = Some(change);
            }
        }
        let embed = render(card);
        match card.message {
            Some(message) => {
                let _ = self
                    .chat
                    .edit_embed(&self.thread_id, message, &embed, &[])
                    .await;
            }
            None => {
                card.message = self
                    .chat
                    .send_embed(&self.thread_id, &embed, &[])
                    .await
                    .ok();
            }
        }
    }

    pub fn input_fragment(&mut self, index: usize, fragment: &str) {
        if let Some(partial) = self.partial_inputs.get_mut(&index) {
            partial.buffer.push_str(fragment);
        }
    }

    /// The invocation block closed; parse the assembled arguments and enrich
    /// the card with a detail line and, for file-modifying tools, a diff.
    pub async fn close_block(&mut self, index: usize) {
        let partial = match self.partial_inputs.remove(&index) {
            Some(partial) => partial,
            None => return,
        };
        let input: Value = match serde_json::from_str(&partial.buffer) {
            Ok(input) => input,
            Err(_) => return,
        };
        let detail = detail_from_input(&partial.name, &input);
        let change = file_change(&partial.name, &input);
        if let Some(change) = &change {
            self.touched_paths.push(PathBuf::from(&change.path));
        }
        if let Some(card) = self.cards.get_mut(&partial.call_id) {
            card.detail = detail;
            card.change = change;
            let embed = render(card);
            if let Some(message) = card.message {
                let _ = self
                    .chat
                    .edit_embed(&self.thread_id, message, &embed, &[])
                    .await;
            }
        }
    }

    /// Finalize a card from its tool result. An unknown `call_id` (result
    /// replayed after a sweep, or arriving before its block) synthesizes a
    /// fresh card so the outcome is never silently dropped.
    pub async fn result(&mut self, call_id: &str, output: &str, is_error: bool) {
        if !self.cards.contains_key(call_id) {
            self.insert_card(call_id, "tool");
        }
        let tail_chars = self.tail_chars;
        let card = self
            .cards
            .get_mut(call_id)
            .filter(|card| card.status == CardStatus::Running);
        let card = match card {
            Some(card) => card,
            // Terminal cards stay terminal.
            None => return,
        };
        card.status = if is_error {
            CardStatus::Error
        } else {
            CardStatus::Done
        };
        // A card carrying a diff is worth keeping after the turn ends.
        card.persistent = card.change.is_some();
        let mut embed = render(card);
        let tail = tail(output, tail_chars);
        if !tail.is_empty() && card.change.is_none() {
            embed.description.push_str("\n```\n");
            embed.description.push_str(&tail);
            embed.description.push_str("\n```");
        }
        match card.message {
            Some(message) => {
                let _ = self
                    .chat
                    .edit_embed(&self.thread_id, message, &embed, &[])
                    .await;
            }
            None => {
                card.message = self
                    .chat
                    .send_embed(&self.thread_id, &embed, &[])
                    .await
                    .ok();
            }
        }
    }

    /// Refresh the elapsed-time line of a long-running card. An unknown
    /// `call_id` (heartbeat outliving a sweep, or arriving before its
    /// block) synthesizes a fallback card so the activity stays visible.
    pub async fn progress(&mut self, call_id: &str, elapsed_ms: u64) {
        if !self.cards.contains_key(call_id) {
            self.insert_card(call_id, "tool");
        }
        let card = self
            .cards
            .get_mut(call_id)
            .filter(|card| card.status == CardStatus::Running);
        if let Some(card) = card {
            let mut embed = render(card);
            embed.footer = Some(format!("running for {}s", elapsed_ms / 1000));
            match card.message {
                Some(message) => {
                    let _ = self
                        .chat
                        .edit_embed(&self.thread_id, message, &embed, &[])
                        .await;
                }
                None => {
                    card.message = self
                        .chat
                        .send_embed(&self.thread_id, &embed, &[])
                        .await
                        .ok();
                }
            }
        }
    }

    /// Delete every non-persistent card message. Runs at end of turn and
    /// before a blocking prompt takes over the thread.
    pub async fn sweep_ephemeral(&mut self) {
        for call_id in std::mem::take(&mut self.order) {
            let card = match self.cards.remove(&call_id) {
                Some(card) => card,
                None => continue,
            };
            if card.persistent {
                continue;
            }
            if let Some(message) = card.message {
                let _ = self.chat.delete_message(&self.thread_id, message).await;
            }
        }
        self.cards.clear();
        self.partial_inputs.clear();
    }

    /// Reset per-turn counters; card state is swept separately.
    pub fn finish_turn(&mut self) {
        self.turn_log.clear();
    }

    /// One-line activity summary for the status indicator, e.g.
    /// `running tools: bash ×2, read`.
    pub fn summary(&self) -> Option<String> {
        if self.turn_log.is_empty() {
            return None;
        }
        let mut counts: Vec<(String, usize)> = Vec::new();
        for name in &self.turn_log {
            match counts.iter_mut().find(|(n, _)| n == name) {
                Some((_, count)) => *count += 1,
                None => counts.push((name.clone(), 1)),
            }
        }
        let parts = counts
            .into_iter()
            .map(|(name, count)| {
                if count > 1 {
                    format!("{name} ×{count}")
                } else {
                    name
                }
            })
            .collect::<Vec<_>>()
            .join(", ");
        Some(format!("running tools: {parts}"))
    }

    /// Deliver images referenced by the turn text or touched by its tools.
    /// Each file is sent at most once per run.
    pub async fn deliver_images(&mut self, turn_text: &str, working_dir: &Path) {
        let mut candidates = scan_image_paths(turn_text, working_dir);
        for path in self.touched_paths.drain(..) {
            if is_image(&path) {
                candidates.push(resolve(&path, working_dir));
            }
        }
        for path in candidates {
            if !path.is_file() || !self.delivered_images.insert(path.clone()) {
                continue;
            }
            let caption = path
                .file_name()
                .and_then(|name| name.to_str())
                .map(str::to_string);
            let _ = self
                .chat
                .send_file(&self.thread_id, &path, caption.as_deref())
                .await;
        }
    }
}

fn render(card: &ToolCard) -> Embed {
    let (icon, color) = match card.status {
        CardStatus::Running => ("…", RUNNING_COLOR),
        CardStatus::Done => ("✓", DONE_COLOR),
        CardStatus::Error => ("✗", ERROR_COLOR),
    };
    let mut description = match &card.detail {
        Some(detail) => format!("{icon} **{}** `{detail}`", card.name),
        None => format!("{icon} **{}**", card.name),
    };
    if let Some(change) = &card.change {
        description.push_str(&format!("\n```diff\n{}\n```", render_diff(change)));
    }
    let footer = match card.status {
        CardStatus::Running => None,
        _ => Some(format!("{:.1}s", card.started.elapsed().as_secs_f64())),
    };
    Embed {
        title: None,
        description,
        color: Some(color),
        footer,
    }
}

fn render_diff(change: &FileChange) -> String {
    let mut out = format!("--- {}", change.path);
    if let Some(removed) = &change.removed {
        for line in removed.lines().take(20) {
            out.push_str("\n-");
            out.push_str(line);
        }
    }
    for line in change.added.lines().take(20) {
        out.push_str("\n+");
        out.push_str(line);
    }
    out
}

fn file_change(tool_name: &str, input: &Value) -> Option<FileChange> {
    let path = input
        .get("file_path")
        .or_else(|| input.get("path"))
        .and_then(Value::as_str)?
        .to_string();
    match tool_name.to_ascii_lowercase().as_str() {
        "edit" => Some(FileChange {
            path,
            removed: input
                .get("old_string")
                .and_then(Value::as_str)
                .map(str::to_string),
            added: input
                .get("new_string")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        "write" => Some(FileChange {
            path,
            removed: None,
            added: input
                .get("content")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        }),
        _ => None,
    }
}

fn tail(output: &str, max_chars: usize) -> String {
    let trimmed = output.trim();
    let total = trimmed.chars().count();
    if total <= max_chars {
        return trimmed.to_string();
    }
    let skip = total - max_chars;
    let start = trimmed
        .char_indices()
        .nth(skip)
        .map(|(i, _)| i)
        .unwrap_or(0);
    format!("…{}", &trimmed[start..])
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn resolve(path: &Path, working_dir: &Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        working_dir.join(path)
    }
}

/// Pull path-looking tokens with image extensions out of assistant text.
fn scan_image_paths(text: &str, working_dir: &Path) -> Vec<PathBuf> {
    text.split_whitespace()
        .map(|token| token.trim_matches(|c: char| !c.is_alphanumeric() && c != '/' && c != '.' && c != '_' && c != '-'))
        .filter(|token| !token.is_empty())
        .map(Path::new)
        .filter(|path| is_image(path))
        .map(|path| resolve(path, working_dir))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn edit_input_yields_diff() {
        let input = json!({
            "file_path": "src/main.rs",
            "old_string": "let x = 1;",
            "new_string": "let x = 2;",
        });
        let change = file_change("Edit", &input).unwrap();
        assert_eq!(change.path, "src/main.rs");
        let rendered = render_diff(&change);
        assert!(rendered.contains("-let x = 1;"));
        assert!(rendered.contains("+let x = 2;"));
    }

    #[test]
    fn write_input_yields_additions_only() {
        let input = json!({ "file_path": "notes.md", "content": "hello" });
        let change = file_change("write", &input).unwrap();
        assert!(change.removed.is_none());
        assert_eq!(change.added, "hello");
    }

    #[test]
    fn non_file_tools_yield_no_diff() {
        let input = json!({ "command": "ls" });
        assert!(file_change("bash", &input).is_none());
    }

    #[test]
    fn tail_keeps_last_chars() {
        assert_eq!(tail("abcdef", 10), "abcdef");
        assert_eq!(tail("abcdef", 3), "…def");
    }

    #[test]
    fn image_paths_found_in_text() {
        let paths = scan_image_paths(
            "saved the chart to output/plot.png and notes to notes.txt",
            Path::new("/work"),
        );
        assert_eq!(paths, vec![PathBuf::from("/work/output/plot.png")]);
    }
}
