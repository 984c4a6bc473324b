#![allow(dead_code)]

use std::collections::{HashMap, HashSet, VecDeque};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::time::Instant;

use agent_relay::chat::{Button, ChatClient, Embed, InboundMessage, MessageRef, ThreadId};
use agent_relay::commands::CommandLayer;
use agent_relay::config::RelayConfig;
use agent_relay::events::{
    AgentEvent, AssistantTurnData, InitData, ResultData, RunOutcome, TextDeltaData,
};
use agent_relay::orchestrator::Orchestrator;
use agent_relay::registry::SessionRegistry;
use agent_relay::runtime::{
    AgentRun, AgentRuntime, GateDecision, ModelInfo, PermissionGate, PermissionRequest, RunRequest,
};
use agent_relay::store::MemoryStore;
use agent_relay_error::RelayError;

pub const WORK_DIR: &str = "/tmp/agent-relay-test";

// ---------------------------------------------------------------------------
// Chat mock

#[derive(Debug, Clone)]
pub enum ChatOp {
    SendText(u64, String),
    SendEmbed(u64, String),
    EditText(u64, String),
    EditEmbed(u64, String),
    Delete(u64),
    SendFile(PathBuf),
    Typing(bool),
    CreateThread(String),
}

#[derive(Debug, Default)]
pub struct ChatState {
    pub ops: Vec<ChatOp>,
    pub texts: HashMap<u64, String>,
    pub embeds: HashMap<u64, Embed>,
    /// Button rows attached to each embed, latest render wins.
    pub buttons: HashMap<u64, Vec<Button>>,
    pub deleted: HashSet<u64>,
    /// Text message ids in send order.
    pub text_order: Vec<u64>,
}

pub struct MockChat {
    next_id: AtomicU64,
    /// Remaining edit calls to fail with a transient error.
    fail_edits: AtomicU64,
    pub state: StdMutex<ChatState>,
    pub limit: usize,
}

impl MockChat {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            fail_edits: AtomicU64::new(0),
            state: StdMutex::new(ChatState::default()),
            limit: 2000,
        })
    }

    pub fn with_limit(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            fail_edits: AtomicU64::new(0),
            state: StdMutex::new(ChatState::default()),
            limit,
        })
    }

    /// Make the next `count` edit calls fail as if the platform rate-limited
    /// them.
    pub fn fail_next_edits(&self, count: u64) {
        self.fail_edits.store(count, Ordering::SeqCst);
    }

    fn take_edit_failure(&self) -> bool {
        self.fail_edits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn next(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Content of surviving (non-deleted) text messages, in send order.
    pub fn surviving_texts(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .text_order
            .iter()
            .filter(|id| !state.deleted.contains(id))
            .filter_map(|id| state.texts.get(id).cloned())
            .collect()
    }

    pub fn sent_text_containing(&self, needle: &str) -> bool {
        self.surviving_texts()
            .iter()
            .any(|text| text.contains(needle))
    }

    /// Descriptions of surviving embeds.
    pub fn surviving_embeds(&self) -> Vec<Embed> {
        let state = self.state.lock().unwrap();
        state
            .embeds
            .iter()
            .filter(|(id, _)| !state.deleted.contains(*id))
            .map(|(_, embed)| embed.clone())
            .collect()
    }

    pub fn edit_count(&self) -> usize {
        self.state
            .lock()
            .unwrap()
            .ops
            .iter()
            .filter(|op| matches!(op, ChatOp::EditText(..)))
            .count()
    }

    /// Sends and edits (text or embed) whose content contains `needle`.
    pub fn op_count_containing(&self, needle: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .ops
            .iter()
            .filter(|op| match op {
                ChatOp::SendText(_, text)
                | ChatOp::EditText(_, text)
                | ChatOp::SendEmbed(_, text)
                | ChatOp::EditEmbed(_, text) => text.contains(needle),
                _ => false,
            })
            .count()
    }

    /// Button custom ids on the embed whose description contains `needle`.
    pub fn button_ids_for(&self, needle: &str) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state
            .embeds
            .iter()
            .find(|(_, embed)| embed.description.contains(needle))
            .and_then(|(id, _)| state.buttons.get(id))
            .map(|buttons| {
                buttons
                    .iter()
                    .map(|button| button.custom_id.clone())
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl ChatClient for MockChat {
    async fn send_text(&self, _thread: &ThreadId, text: &str) -> Result<MessageRef, RelayError> {
        let id = self.next();
        let mut state = self.state.lock().unwrap();
        state.ops.push(ChatOp::SendText(id, text.to_string()));
        state.texts.insert(id, text.to_string());
        state.text_order.push(id);
        Ok(MessageRef(id))
    }

    async fn send_embed(
        &self,
        _thread: &ThreadId,
        embed: &Embed,
        buttons: &[Button],
    ) -> Result<MessageRef, RelayError> {
        let id = self.next();
        let mut state = self.state.lock().unwrap();
        state
            .ops
            .push(ChatOp::SendEmbed(id, embed.description.clone()));
        state.embeds.insert(id, embed.clone());
        state.buttons.insert(id, buttons.to_vec());
        Ok(MessageRef(id))
    }

    async fn edit_text(
        &self,
        _thread: &ThreadId,
        message: MessageRef,
        text: &str,
    ) -> Result<(), RelayError> {
        let mut state = self.state.lock().unwrap();
        if state.deleted.contains(&message.0) {
            return Err(RelayError::MessageDeleted);
        }
        if self.take_edit_failure() {
            return Err(RelayError::DeliveryError {
                message: "rate limited".to_string(),
            });
        }
        state.ops.push(ChatOp::EditText(message.0, text.to_string()));
        state.texts.insert(message.0, text.to_string());
        Ok(())
    }

    async fn edit_embed(
        &self,
        _thread: &ThreadId,
        message: MessageRef,
        embed: &Embed,
        buttons: &[Button],
    ) -> Result<(), RelayError> {
        let mut state = self.state.lock().unwrap();
        if state.deleted.contains(&message.0) {
            return Err(RelayError::MessageDeleted);
        }
        state
            .ops
            .push(ChatOp::EditEmbed(message.0, embed.description.clone()));
        state.embeds.insert(message.0, embed.clone());
        state.buttons.insert(message.0, buttons.to_vec());
        Ok(())
    }

    async fn delete_message(
        &self,
        _thread: &ThreadId,
        message: MessageRef,
    ) -> Result<(), RelayError> {
        let mut state = self.state.lock().unwrap();
        state.ops.push(ChatOp::Delete(message.0));
        state.deleted.insert(message.0);
        Ok(())
    }

    async fn send_file(
        &self,
        _thread: &ThreadId,
        path: &Path,
        _caption: Option<&str>,
    ) -> Result<MessageRef, RelayError> {
        let id = self.next();
        self.state
            .lock()
            .unwrap()
            .ops
            .push(ChatOp::SendFile(path.to_path_buf()));
        Ok(MessageRef(id))
    }

    async fn create_thread(
        &self,
        _channel_id: &str,
        _source: MessageRef,
        title: &str,
    ) -> Result<ThreadId, RelayError> {
        let id = self.next();
        let thread_id = format!("thread-{id}");
        self.state
            .lock()
            .unwrap()
            .ops
            .push(ChatOp::CreateThread(title.to_string()));
        Ok(thread_id)
    }

    async fn set_typing(&self, _thread: &ThreadId, active: bool) -> Result<(), RelayError> {
        self.state.lock().unwrap().ops.push(ChatOp::Typing(active));
        Ok(())
    }

    fn message_limit(&self) -> usize {
        self.limit
    }
}

// ---------------------------------------------------------------------------
// Runtime mock

/// One step of a scripted run: emit an event, invoke the permission gate,
/// or block until the orchestrator injects a user turn.
pub enum ScriptItem {
    Event(AgentEvent),
    Gate(PermissionRequest),
    AwaitUserTurn,
}

pub struct MockRuntime {
    scripts: StdMutex<VecDeque<Vec<ScriptItem>>>,
    pub requests: StdMutex<Vec<RunRequest>>,
    pub decisions: Arc<StdMutex<Vec<GateDecision>>>,
    pub user_turns: Arc<StdMutex<Vec<String>>>,
    /// Runs currently between start and terminal result / close.
    active: Arc<AtomicUsize>,
    max_active: Arc<AtomicUsize>,
}

impl MockRuntime {
    pub fn new(scripts: Vec<Vec<ScriptItem>>) -> Arc<Self> {
        Arc::new(Self {
            scripts: StdMutex::new(scripts.into_iter().collect()),
            requests: StdMutex::new(Vec::new()),
            decisions: Arc::new(StdMutex::new(Vec::new())),
            user_turns: Arc::new(StdMutex::new(Vec::new())),
            active: Arc::new(AtomicUsize::new(0)),
            max_active: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }

    pub fn request(&self, index: usize) -> RunRequest {
        self.requests.lock().unwrap()[index].clone()
    }

    /// High-water mark of simultaneously live runs.
    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentRuntime for MockRuntime {
    async fn start_run(
        &self,
        request: RunRequest,
        gate: PermissionGate,
    ) -> Result<Box<dyn AgentRun>, RelayError> {
        self.requests.lock().unwrap().push(request);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_default();
        let live = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(live, Ordering::SeqCst);
        let (turn_tx, turn_rx) = mpsc::unbounded_channel();
        Ok(Box::new(MockRun {
            script: script.into_iter().collect(),
            gate,
            decisions: self.decisions.clone(),
            user_turns: self.user_turns.clone(),
            turn_tx,
            turn_rx,
            pending_gate: None,
            waiting_turn: false,
            closed: false,
            active: self.active.clone(),
            finished: false,
        }))
    }

    async fn models(&self) -> Result<Vec<ModelInfo>, RelayError> {
        Ok(vec![ModelInfo {
            id: "mock".to_string(),
            name: Some("Mock".to_string()),
        }])
    }
}

pub struct MockRun {
    script: VecDeque<ScriptItem>,
    gate: PermissionGate,
    decisions: Arc<StdMutex<Vec<GateDecision>>>,
    user_turns: Arc<StdMutex<Vec<String>>>,
    turn_tx: mpsc::UnboundedSender<String>,
    turn_rx: mpsc::UnboundedReceiver<String>,
    /// In-progress gate call, kept across cancelled `next_event` polls so
    /// the script position is never lost.
    pending_gate: Option<std::pin::Pin<Box<dyn Future<Output = GateDecision> + Send>>>,
    waiting_turn: bool,
    closed: bool,
    active: Arc<AtomicUsize>,
    finished: bool,
}

impl MockRun {
    fn finish(&mut self) {
        if !self.finished {
            self.finished = true;
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[async_trait]
impl AgentRun for MockRun {
    async fn next_event(&mut self) -> Option<AgentEvent> {
        loop {
            if self.closed {
                self.finish();
                return None;
            }
            if let Some(gate) = self.pending_gate.as_mut() {
                let decision = gate.as_mut().await;
                self.pending_gate = None;
                self.decisions.lock().unwrap().push(decision);
                continue;
            }
            if self.waiting_turn {
                if self.turn_rx.recv().await.is_none() {
                    self.finish();
                    return None;
                }
                self.waiting_turn = false;
                continue;
            }
            match self.script.pop_front() {
                Some(ScriptItem::Event(event)) => {
                    if matches!(event, AgentEvent::Result(_)) {
                        self.finish();
                    }
                    return Some(event);
                }
                Some(ScriptItem::Gate(request)) => {
                    self.pending_gate = Some((self.gate)(request));
                }
                Some(ScriptItem::AwaitUserTurn) => {
                    self.waiting_turn = true;
                }
                None => {
                    self.finish();
                    return None;
                }
            }
        }
    }

    async fn push_user_turn(&mut self, text: String) -> Result<(), RelayError> {
        self.user_turns.lock().unwrap().push(text.clone());
        let _ = self.turn_tx.send(text);
        Ok(())
    }

    async fn close(&mut self) {
        self.closed = true;
        self.finish();
    }
}

// ---------------------------------------------------------------------------
// Harness

pub struct Harness {
    pub chat: Arc<MockChat>,
    pub runtime: Arc<MockRuntime>,
    pub registry: SessionRegistry,
    pub orchestrator: Orchestrator,
    pub commands: CommandLayer,
}

pub fn test_config() -> RelayConfig {
    RelayConfig {
        min_flush_interval: Duration::from_millis(10),
        max_turns_per_run: 5,
        auto_resume_turn_ceiling: 10,
        auto_allow_jitter: Duration::ZERO,
        ..RelayConfig::default()
    }
}

pub fn harness(scripts: Vec<Vec<ScriptItem>>) -> Harness {
    harness_with_config(scripts, test_config())
}

pub fn harness_with_config(scripts: Vec<Vec<ScriptItem>>, config: RelayConfig) -> Harness {
    let chat = MockChat::new();
    let runtime = MockRuntime::new(scripts);
    let registry = SessionRegistry::new(Arc::new(MemoryStore::new()), config);
    let orchestrator = Orchestrator::new(chat.clone(), runtime.clone(), registry.clone());
    let commands = CommandLayer::new(orchestrator.clone());
    Harness {
        chat,
        runtime,
        registry,
        orchestrator,
        commands,
    }
}

impl Harness {
    /// Open a thread and kick off the first scripted run.
    pub async fn start(&self, prompt: &str) -> ThreadId {
        self.orchestrator
            .start_conversation(
                "channel-1",
                MessageRef(9000),
                "test",
                prompt.to_string(),
                PathBuf::from(WORK_DIR),
            )
            .await
            .expect("start conversation")
    }

    pub async fn reply(&self, thread_id: &ThreadId, text: &str) {
        static REPLY_ID: AtomicU64 = AtomicU64::new(10_000);
        let inbound = InboundMessage {
            thread_id: thread_id.clone(),
            message: MessageRef(REPLY_ID.fetch_add(1, Ordering::SeqCst)),
            author: "tester".to_string(),
            text: text.to_string(),
            attachments: Vec::new(),
        };
        self.orchestrator
            .handle_message(inbound)
            .await
            .expect("handle message");
    }

    pub async fn is_idle(&self, thread_id: &ThreadId) -> bool {
        match self.registry.get(thread_id).await {
            Some(session) => !session.lock().await.is_busy(),
            None => true,
        }
    }

    pub async fn wait_idle(&self, thread_id: &ThreadId) {
        let thread_id = thread_id.clone();
        wait_for(|| async { self.is_idle(&thread_id).await }).await;
    }

    pub async fn remote_session_id(&self, thread_id: &ThreadId) -> Option<String> {
        let session = self.registry.get(thread_id).await?;
        let id = session.lock().await.remote_session_id.clone();
        id
    }
}

pub async fn wait_for<F, Fut>(mut cond: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if cond().await {
            return;
        }
        if Instant::now() > deadline {
            panic!("condition not met within 5s");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ---------------------------------------------------------------------------
// Event constructors

pub fn init_event(session_id: &str) -> ScriptItem {
    ScriptItem::Event(AgentEvent::Init(InitData {
        session_id: session_id.to_string(),
        model: None,
        context_window: None,
    }))
}

pub fn delta(text: &str) -> ScriptItem {
    ScriptItem::Event(AgentEvent::TextDelta(TextDeltaData {
        index: 0,
        delta: text.to_string(),
    }))
}

pub fn turn(text: &str) -> ScriptItem {
    ScriptItem::Event(AgentEvent::AssistantTurn(AssistantTurnData {
        text: text.to_string(),
    }))
}

pub fn success(cost_usd: f64, turns: u32) -> ScriptItem {
    ScriptItem::Event(AgentEvent::Result(ResultData {
        outcome: RunOutcome::Success,
        cost_usd,
        turns,
        usage: None,
    }))
}

pub fn turn_limit(turns: u32) -> ScriptItem {
    ScriptItem::Event(AgentEvent::Result(ResultData {
        outcome: RunOutcome::TurnLimit,
        cost_usd: 0.0,
        turns,
        usage: None,
    }))
}

pub fn run_error(message: &str) -> ScriptItem {
    ScriptItem::Event(AgentEvent::Result(ResultData {
        outcome: RunOutcome::Error {
            message: message.to_string(),
        },
        cost_usd: 0.0,
        turns: 0,
        usage: None,
    }))
}
