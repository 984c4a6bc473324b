//! Plan approval prompt: surfaces the agent's plan document and blocks the
//! run on a ternary decision — approve and clear context, approve in place,
//! or reject with feedback.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::{oneshot, Mutex};

use agent_relay_error::RelayError;

use crate::chat::{Button, ButtonStyle, ChatClient, Embed, InboundMessage, MessageRef, ThreadId};

const PLAN_COLOR: u32 = 0xFEE75C;
const PLAN_PREVIEW_CHARS: usize = 1800;

pub const BUTTON_APPROVE_CLEAR: &str = "plan:clear";
pub const BUTTON_APPROVE_KEEP: &str = "plan:keep";
pub const BUTTON_REJECT: &str = "plan:reject";

fn buttons() -> Vec<Button> {
    vec![
        Button {
            custom_id: BUTTON_APPROVE_CLEAR.to_string(),
            label: "Approve & clear context".to_string(),
            style: ButtonStyle::Primary,
        },
        Button {
            custom_id: BUTTON_APPROVE_KEEP.to_string(),
            label: "Approve".to_string(),
            style: ButtonStyle::Success,
        },
        Button {
            custom_id: BUTTON_REJECT.to_string(),
            label: "Reject".to_string(),
            style: ButtonStyle::Danger,
        },
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanDecision {
    /// Allow the tool call, then tear the run down, drop the remote session
    /// id, and re-queue the plan as a fresh instruction.
    ApproveClear,
    /// Allow the tool call unchanged.
    ApproveKeep,
    /// Deny the tool call; the agent continues the turn with the feedback
    /// (or a generic revise instruction) as the denial reason.
    Reject { feedback: Option<String> },
}

/// Map one free-text reply to a decision. Anything not recognized as an
/// approval or bare rejection becomes rejection feedback.
pub fn parse_reply(text: &str) -> PlanDecision {
    let trimmed = text.trim();
    match trimmed.to_ascii_lowercase().as_str() {
        "1" | "clear" | "clear context" => PlanDecision::ApproveClear,
        "2" | "approve" | "approved" | "yes" | "y" | "lgtm" | "looks good" | "ok" | "go"
        | "go ahead" | "proceed" => PlanDecision::ApproveKeep,
        "3" | "reject" | "rejected" | "no" | "n" | "revise" => {
            PlanDecision::Reject { feedback: None }
        }
        _ => PlanDecision::Reject {
            feedback: Some(trimmed.to_string()),
        },
    }
}

/// Locate the most recently modified plan document under the working
/// directory. Files older than the recency window are stale output from a
/// previous planning phase and are ignored.
pub fn find_recent_plan(working_dir: &Path, window: Duration) -> Option<String> {
    let now = SystemTime::now();
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    for dir in [working_dir.to_path_buf(), working_dir.join("plans")] {
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("md") {
                continue;
            }
            let modified = match entry.metadata().and_then(|meta| meta.modified()) {
                Ok(modified) => modified,
                Err(_) => continue,
            };
            match now.duration_since(modified) {
                Ok(age) if age <= window => {}
                _ => continue,
            }
            if newest
                .as_ref()
                .map(|(best, _)| modified > *best)
                .unwrap_or(true)
            {
                newest = Some((modified, path));
            }
        }
    }
    let (_, path) = newest?;
    fs::read_to_string(path).ok()
}

/// A rendered approval prompt awaiting exactly one decisive reply.
pub struct PendingPlan {
    chat: Arc<dyn ChatClient>,
    thread_id: ThreadId,
    /// Plan content re-queued as a fresh instruction on approve-and-clear.
    plan: Option<String>,
    message: Mutex<Option<MessageRef>>,
    resolver: Mutex<Option<oneshot::Sender<PlanDecision>>>,
}

impl PendingPlan {
    pub async fn open(
        chat: Arc<dyn ChatClient>,
        thread_id: ThreadId,
        plan: Option<String>,
    ) -> Result<(Arc<Self>, oneshot::Receiver<PlanDecision>), RelayError> {
        if let Some(content) = plan.as_deref() {
            let preview = truncate_preview(content);
            let _ = chat.send_text(&thread_id, &preview).await;
        }
        let description = format!(
            "{}\n\n`1` approve and clear context\n`2` approve\n`3` reject\n\nAnything else is sent back as revision feedback.",
            if plan.is_some() {
                "The agent wants to start implementing the plan above."
            } else {
                "The agent wants to exit planning and start implementing."
            }
        );
        let embed = Embed {
            title: Some("Plan ready for review".to_string()),
            description,
            color: Some(PLAN_COLOR),
            footer: None,
        };
        let message = chat.send_embed(&thread_id, &embed, &buttons()).await?;
        let (tx, rx) = oneshot::channel();
        let pending = Arc::new(Self {
            chat,
            thread_id,
            plan,
            message: Mutex::new(Some(message)),
            resolver: Mutex::new(Some(tx)),
        });
        Ok((pending, rx))
    }

    pub fn plan_text(&self) -> Option<&str> {
        self.plan.as_deref()
    }

    /// Every reply is decisive; the prompt resolves on the first one.
    pub async fn handle_reply(&self, reply: &InboundMessage) -> Result<bool, RelayError> {
        self.resolve(parse_reply(&reply.text)).await;
        Ok(true)
    }

    /// A press on one of the prompt's buttons. Returns `Ok(false)` for a
    /// custom id this prompt does not own.
    pub async fn handle_button(&self, custom_id: &str) -> Result<bool, RelayError> {
        let decision = match custom_id {
            BUTTON_APPROVE_CLEAR => PlanDecision::ApproveClear,
            BUTTON_APPROVE_KEEP => PlanDecision::ApproveKeep,
            BUTTON_REJECT => PlanDecision::Reject { feedback: None },
            _ => return Ok(false),
        };
        self.resolve(decision).await;
        Ok(true)
    }

    async fn resolve(&self, decision: PlanDecision) {
        let verdict = match &decision {
            PlanDecision::ApproveClear => "Approved — context will be cleared".to_string(),
            PlanDecision::ApproveKeep => "Approved".to_string(),
            PlanDecision::Reject { feedback: None } => "Rejected".to_string(),
            PlanDecision::Reject {
                feedback: Some(text),
            } => format!("Rejected with feedback: {text}"),
        };
        let embed = Embed {
            title: Some("Plan review".to_string()),
            description: verdict,
            color: Some(PLAN_COLOR),
            footer: None,
        };
        if let Some(message) = *self.message.lock().await {
            let _ = self
                .chat
                .edit_embed(&self.thread_id, message, &embed, &[])
                .await;
        }
        if let Some(tx) = self.resolver.lock().await.take() {
            let _ = tx.send(decision);
        }
    }
}

fn truncate_preview(content: &str) -> String {
    if content.chars().count() <= PLAN_PREVIEW_CHARS {
        return content.to_string();
    }
    let cut = content
        .char_indices()
        .nth(PLAN_PREVIEW_CHARS)
        .map(|(i, _)| i)
        .unwrap_or(content.len());
    format!("{}…", &content[..cut])
}
