//! Agent-runtime boundary: starting runs, consuming their event streams,
//! pushing mid-run user turns, and the permission gate through which the
//! runtime asks before executing a tool.

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::Future;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use agent_relay_error::RelayError;

use crate::events::AgentEvent;

#[derive(Debug, Clone)]
pub struct RunRequest {
    pub prompt: String,
    /// Resume an existing runtime session, or `None` to start fresh.
    pub resume_session_id: Option<String>,
    pub working_dir: PathBuf,
    pub model: Option<String>,
    /// Per-run turn ceiling enforced by the runtime. A run stopped by this
    /// ceiling reports `RunOutcome::TurnLimit`.
    pub max_turns: u32,
}

/// What the runtime is blocked on when the permission gate fires.
///
/// The two blocking kinds suspend the run until a human answers; everything
/// else is auto-allowed by the orchestrator.
#[derive(Debug, Clone)]
pub enum PermissionRequest {
    Interactive(InteractiveRequest),
    Plan(PlanRequest),
    Generic {
        call_id: String,
        tool_name: String,
        input: Value,
    },
}

/// A structured, possibly multi-part, possibly multi-select question.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractiveRequest {
    pub call_id: String,
    pub questions: Vec<QuestionSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuestionSpec {
    /// Short label keying the answer in the resolved map.
    pub header: String,
    pub text: String,
    #[serde(default)]
    pub multi_select: bool,
    pub options: Vec<String>,
}

/// The agent wants to leave its planning phase and start executing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlanRequest {
    pub call_id: String,
    /// Plan text carried in the tool input, if the runtime provided one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<String>,
}

#[derive(Debug, Clone)]
pub enum GateDecision {
    Allow,
    /// Allow, substituting the tool's input (used to hand collected answers
    /// back to a question tool).
    AllowWithInput(Value),
    Deny { reason: String },
}

/// Callback-driven permission gate handed to the runtime at run start.
pub type PermissionGate = Arc<
    dyn Fn(PermissionRequest) -> Pin<Box<dyn Future<Output = GateDecision> + Send>> + Send + Sync,
>;

/// One in-flight agent run. Events arrive strictly ordered; the stream ends
/// after the terminal `Result` event or when the run is closed.
#[async_trait]
pub trait AgentRun: Send {
    /// Must be cancel-safe: callers poll this inside `select!`, and a
    /// dropped call must not lose an event or any in-progress gate state.
    async fn next_event(&mut self) -> Option<AgentEvent>;

    /// Deliver an additional user turn to the running agent.
    async fn push_user_turn(&mut self, text: String) -> Result<(), RelayError>;

    /// Forcibly end the run. Idempotent.
    async fn close(&mut self);
}

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    async fn start_run(
        &self,
        request: RunRequest,
        gate: PermissionGate,
    ) -> Result<Box<dyn AgentRun>, RelayError>;

    /// Selectable model identifiers, queried out of band.
    async fn models(&self) -> Result<Vec<ModelInfo>, RelayError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// Static entries used when the runtime cannot be asked for its model list.
pub fn fallback_models() -> Vec<ModelInfo> {
    vec![
        ModelInfo {
            id: "default".to_string(),
            name: Some("Default".to_string()),
        },
        ModelInfo {
            id: "sonnet".to_string(),
            name: Some("Sonnet".to_string()),
        },
        ModelInfo {
            id: "opus".to_string(),
            name: Some("Opus".to_string()),
        },
    ]
}
