//! Typed event protocol consumed from the agent runtime.
//!
//! A run yields an ordered stream of these events: text deltas and tool
//! lifecycle interleaved with control messages, terminated by exactly one
//! `Result` event (unless the run is aborted first).

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// First event of every run. Carries the runtime's own session handle,
    /// which must be persisted so follow-up messages can resume the session.
    Init(InitData),
    /// The runtime compacted the conversation history to free context.
    CompactionNotice(CompactionData),
    /// Incremental assistant text for the current turn.
    TextDelta(TextDeltaData),
    /// A streaming content block opened (text or tool invocation).
    BlockStart(BlockStartData),
    /// A fragment of a tool invocation's JSON arguments.
    InputDelta(InputDeltaData),
    /// The content block at `index` closed; accumulated input is complete.
    BlockEnd(BlockEndData),
    /// A tool finished and produced output.
    ToolResult(ToolResultData),
    /// The complete assistant message for the turn, non-incremental.
    /// Authoritative over whatever was accumulated from deltas.
    AssistantTurn(AssistantTurnData),
    /// Heartbeat for a long-running tool.
    ToolProgress(ToolProgressData),
    /// Terminal event: the run finished, hit its turn ceiling, or failed.
    Result(ResultData),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitData {
    pub session_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_window: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionData {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trigger: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_saved: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextDeltaData {
    pub index: usize,
    pub delta: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockStartData {
    pub index: usize,
    pub block: BlockKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockKind {
    Text,
    ToolUse { call_id: String, name: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputDeltaData {
    pub index: usize,
    pub fragment: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockEndData {
    pub index: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResultData {
    pub call_id: String,
    pub output: String,
    #[serde(default)]
    pub is_error: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantTurnData {
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolProgressData {
    pub call_id: String,
    pub elapsed_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultData {
    pub outcome: RunOutcome,
    /// Spend for this run, in USD.
    #[serde(default)]
    pub cost_usd: f64,
    /// Turns the agent executed during this run.
    #[serde(default)]
    pub turns: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<ContextUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    /// Stopped only because the per-run turn ceiling was reached; the
    /// conversation itself is healthy and may be auto-resumed.
    TurnLimit,
    Error { message: String },
}

/// Advisory context-window usage, reported alongside terminal results.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ContextUsage {
    pub used_tokens: u64,
    pub window_tokens: u64,
}

impl ContextUsage {
    pub fn percent_used(&self) -> f64 {
        if self.window_tokens == 0 {
            return 0.0;
        }
        self.used_tokens as f64 / self.window_tokens as f64 * 100.0
    }
}

/// Best-effort extraction of the value a tool argument object carries for
/// display purposes: a file path, a command line, a pattern.
pub fn detail_from_input(tool_name: &str, input: &Value) -> Option<String> {
    let keys: &[&str] = match tool_name.to_ascii_lowercase().as_str() {
        "read" | "write" | "edit" | "notebookedit" => &["file_path", "path"],
        "bash" | "shell" | "exec" => &["command"],
        "grep" | "glob" | "search" => &["pattern", "query"],
        "webfetch" | "fetch" => &["url"],
        _ => &["file_path", "path", "command", "pattern", "query", "url"],
    };
    for key in keys {
        if let Some(value) = input.get(key).and_then(Value::as_str) {
            return Some(truncate_detail(value));
        }
    }
    None
}

const DETAIL_MAX_CHARS: usize = 120;

fn truncate_detail(value: &str) -> String {
    let flat = value.replace('\n', " ");
    let trimmed = flat.trim();
    if trimmed.chars().count() <= DETAIL_MAX_CHARS {
        return trimmed.to_string();
    }
    let cut = trimmed
        .char_indices()
        .nth(DETAIL_MAX_CHARS)
        .map(|(i, _)| i)
        .unwrap_or(trimmed.len());
    format!("{}…", &trimmed[..cut])
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn detail_prefers_tool_specific_keys() {
        let input = json!({ "file_path": "src/lib.rs", "command": "ls" });
        assert_eq!(
            detail_from_input("Read", &input).as_deref(),
            Some("src/lib.rs")
        );
        assert_eq!(detail_from_input("Bash", &input).as_deref(), Some("ls"));
    }

    #[test]
    fn detail_flattens_and_truncates() {
        let long = "x".repeat(300);
        let input = json!({ "command": format!("echo\n{long}") });
        let detail = detail_from_input("Bash", &input).unwrap();
        assert!(detail.starts_with("echo x"));
        assert!(detail.ends_with('…'));
        assert!(detail.chars().count() <= DETAIL_MAX_CHARS + 1);
    }

    #[test]
    fn events_round_trip_through_json() {
        let event = AgentEvent::BlockStart(BlockStartData {
            index: 2,
            block: BlockKind::ToolUse {
                call_id: "call_1".to_string(),
                name: "bash".to_string(),
            },
        });
        let text = serde_json::to_string(&event).unwrap();
        let back: AgentEvent = serde_json::from_str(&text).unwrap();
        match back {
            AgentEvent::BlockStart(data) => assert_eq!(data.index, 2),
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
