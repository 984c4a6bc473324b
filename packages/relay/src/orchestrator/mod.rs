//! Stream orchestrator: drives one agent run per busy session, translating
//! the runtime's event stream into live chat UI, bridging blocking tool
//! permissions to user prompts, and draining queued instructions at
//! teardown.

mod cards;
mod flush;

pub use cards::CardTracker;
pub use flush::{split_message, Chunk, StreamUi};

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use rand::Rng;
use serde_json::json;
use tokio::sync::{Mutex, OnceCell};
use tokio::time::Instant;

use agent_relay_error::{classify_runtime_error, RelayError, RuntimeErrorKind};

use crate::abort::AbortHandle;
use crate::chat::{ChatClient, InboundMessage, MessageRef, ThreadId};
use crate::events::{AgentEvent, BlockKind, ResultData, RunOutcome};
use crate::handoff::HandoffChannel;
use crate::prompt::interactive::{auto_answers, Answers, PendingInteractive};
use crate::prompt::plan::{find_recent_plan, PendingPlan, PlanDecision};
use crate::registry::{RunPhase, Session, SessionRegistry};
use crate::runtime::{
    fallback_models, AgentRun, AgentRuntime, GateDecision, InteractiveRequest, ModelInfo,
    PermissionGate, PermissionRequest, PlanRequest, RunRequest,
};

const THINKING_STATUS: &str = "_Thinking…_";
const CONTINUE_PROMPT: &str = "Continue from where you left off.";
const EXPIRED_NOTICE: &str =
    "This conversation has expired. Start a new one with a fresh top-level message.";
const COMPACTION_NOTICE_TTL: Duration = Duration::from_secs(8);

struct OrchestratorInner {
    chat: Arc<dyn ChatClient>,
    runtime: Arc<dyn AgentRuntime>,
    registry: SessionRegistry,
    /// Model catalog, fetched at most once per orchestrator. Failed fetches
    /// leave the cell empty so a later call retries.
    model_catalog: OnceCell<Vec<ModelInfo>>,
}

/// The engine's front door: inbound messages come in, runs and UI go out.
#[derive(Clone)]
pub struct Orchestrator {
    inner: Arc<OrchestratorInner>,
}

/// Why the run driver's event loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RunExit {
    Completed,
    Errored,
    Aborted,
    /// The stream ended without a terminal result event.
    StreamEnded,
}

impl Orchestrator {
    pub fn new(
        chat: Arc<dyn ChatClient>,
        runtime: Arc<dyn AgentRuntime>,
        registry: SessionRegistry,
    ) -> Self {
        Self {
            inner: Arc::new(OrchestratorInner {
                chat,
                runtime,
                registry,
                model_catalog: OnceCell::new(),
            }),
        }
    }

    pub fn registry(&self) -> &SessionRegistry {
        &self.inner.registry
    }

    /// Selectable models, fetched from the runtime once and cached. Falls
    /// back to a static list when the runtime cannot be queried.
    pub async fn models(&self) -> Vec<ModelInfo> {
        let fetched = self
            .inner
            .model_catalog
            .get_or_try_init(|| self.inner.runtime.models())
            .await;
        match fetched {
            Ok(models) if !models.is_empty() => models.clone(),
            Ok(_) => fallback_models(),
            Err(err) => {
                tracing::warn!(error = %err, "model query failed, using fallback list");
                fallback_models()
            }
        }
    }

    /// Open a dedicated thread for a top-level message and kick off the
    /// first run in it.
    pub async fn start_conversation(
        &self,
        channel_id: &str,
        source: MessageRef,
        title: &str,
        prompt: String,
        working_dir: PathBuf,
    ) -> Result<ThreadId, RelayError> {
        let thread_id = self
            .inner
            .chat
            .create_thread(channel_id, source, title)
            .await?;
        let session = self.inner.registry.create(&thread_id, working_dir).await?;
        self.start_run(session, prompt).await?;
        Ok(thread_id)
    }

    /// Route one follow-up message inside an existing thread.
    #[tracing::instrument(skip_all, fields(thread_id = %inbound.thread_id))]
    pub async fn handle_message(&self, inbound: InboundMessage) -> Result<(), RelayError> {
        let thread_id = inbound.thread_id.clone();
        let session = match self.inner.registry.get_or_rehydrate(&thread_id).await? {
            Some(session) => session,
            // Not a thread we own.
            None => return Ok(()),
        };
        session.lock().await.touch();

        // A blocking prompt owns the thread; every reply goes to it first.
        let (pending_interactive, pending_plan) = {
            let guard = session.lock().await;
            (guard.pending_interactive.clone(), guard.pending_plan.clone())
        };
        if let Some(prompt) = pending_interactive {
            let resolved = prompt.handle_reply(&inbound).await?;
            if resolved {
                session.lock().await.pending_interactive = None;
            }
            return Ok(());
        }
        if let Some(prompt) = pending_plan {
            prompt.handle_reply(&inbound).await?;
            session.lock().await.pending_plan = None;
            return Ok(());
        }

        let text = inbound.text.trim().to_string();
        if text.is_empty() {
            return Ok(());
        }

        enum Route {
            Injected,
            Queued,
            Resume,
            Expired,
        }
        let route = {
            let mut guard = session.lock().await;
            if guard.is_busy() {
                let injected = match guard.handoff.clone() {
                    Some(handoff) => handoff.push(text.clone()).await,
                    None => false,
                };
                if injected {
                    Route::Injected
                } else {
                    guard.queue.push_back(text.clone());
                    Route::Queued
                }
            } else if guard.remote_session_id.is_some() {
                // Reserve the run slot while still holding the guard; a
                // concurrent follow-up must observe the session as busy and
                // queue instead of starting a second run.
                guard.phase = RunPhase::Active;
                Route::Resume
            } else {
                Route::Expired
            }
        };
        match route {
            Route::Injected => {
                tracing::debug!("injected follow-up into live run");
                Ok(())
            }
            Route::Queued => {
                tracing::debug!("queued follow-up behind draining run");
                Ok(())
            }
            Route::Resume => self.start_run(session, text).await,
            Route::Expired => {
                let _ = self.inner.chat.send_text(&thread_id, EXPIRED_NOTICE).await;
                Ok(())
            }
        }
    }

    /// Route a button press to whatever prompt is waiting on it. Unknown
    /// custom ids and threads without a pending prompt are ignored.
    pub async fn handle_interaction(
        &self,
        thread_id: &ThreadId,
        custom_id: &str,
    ) -> Result<(), RelayError> {
        let session = match self.inner.registry.get_or_rehydrate(thread_id).await? {
            Some(session) => session,
            None => return Ok(()),
        };
        let pending_plan = session.lock().await.pending_plan.clone();
        if let Some(prompt) = pending_plan {
            if prompt.handle_button(custom_id).await? {
                session.lock().await.pending_plan = None;
            }
        }
        Ok(())
    }

    /// Start a run for `prompt` and spawn its driver. Boxed so teardown can
    /// recurse into it for the next queued instruction.
    fn start_run(
        &self,
        session: Arc<Mutex<Session>>,
        prompt: String,
    ) -> BoxFuture<'static, Result<(), RelayError>> {
        let orchestrator = self.clone();
        Box::pin(async move {
            let handoff = HandoffChannel::new();
            let (thread_id, resume_session_id, working_dir, abort, background) = {
                let mut guard = session.lock().await;
                guard.phase = RunPhase::Active;
                guard.handoff = Some(handoff.clone());
                guard.touch();
                (
                    guard.thread_id.clone(),
                    guard.remote_session_id.clone(),
                    guard.working_dir.clone(),
                    guard.abort.clone(),
                    guard.background.is_some(),
                )
            };
            let inner = &orchestrator.inner;
            let config = inner.registry.config().clone();
            let model = inner.registry.model().await;

            let ui = Arc::new(Mutex::new(StreamUi::new(
                inner.chat.clone(),
                thread_id.clone(),
            )));
            let tracker = Arc::new(Mutex::new(CardTracker::new(
                inner.chat.clone(),
                thread_id.clone(),
                config.tool_result_tail_chars,
            )));
            if !background {
                ui.lock().await.set_status(THINKING_STATUS).await;
                let _ = inner.chat.set_typing(&thread_id, true).await;
            }

            let gate = orchestrator.permission_gate(GateCtx {
                orchestrator: orchestrator.clone(),
                session: session.clone(),
                thread_id: thread_id.clone(),
                working_dir: working_dir.clone(),
                ui: ui.clone(),
                tracker: tracker.clone(),
            });
            let request = RunRequest {
                prompt,
                resume_session_id,
                working_dir: working_dir.clone(),
                model,
                max_turns: config.max_turns_per_run,
            };
            let run = match inner.runtime.start_run(request, gate).await {
                Ok(run) => Arc::new(Mutex::new(run)),
                Err(err) => {
                    tracing::error!(error = %err, "failed to start agent run");
                    ui.lock().await.clear_status().await;
                    let _ = inner
                        .chat
                        .send_text(&thread_id, &format!("⚠️ Failed to start the agent: {err}"))
                        .await;
                    let _ = inner.chat.set_typing(&thread_id, false).await;
                    let mut guard = session.lock().await;
                    guard.phase = RunPhase::Idle;
                    guard.handoff = None;
                    return Err(err);
                }
            };
            session.lock().await.run = Some(run.clone());

            tokio::spawn(orchestrator.clone().drive(DriveArgs {
                session,
                run,
                handoff,
                abort,
                ui,
                tracker,
                thread_id,
                working_dir,
            }));
            Ok(())
        })
    }

    /// Run driver: consumes the event stream, injects handoff messages, and
    /// owns the flush timer. One driver per run, always ends in teardown.
    async fn drive(self, args: DriveArgs) {
        let DriveArgs {
            session,
            run,
            handoff,
            abort,
            ui,
            tracker,
            thread_id,
            working_dir,
        } = args;
        let config = self.inner.registry.config().clone();
        let mut handoff_open = true;

        let exit = loop {
            // Arm the flush timer only while text is pending.
            let flush_at = {
                let ui = ui.lock().await;
                if ui.dirty {
                    Some(Instant::from_std(ui.last_flush) + config.min_flush_interval)
                } else {
                    None
                }
            };
            let flush_deadline = flush_at.unwrap_or_else(|| Instant::now() + Duration::from_secs(3600));

            tokio::select! {
                biased;
                _ = abort.cancelled() => break RunExit::Aborted,
                injected = handoff.next(), if handoff_open => match injected {
                    Some(text) => {
                        if let Err(err) = run.lock().await.push_user_turn(text).await {
                            tracing::warn!(error = %err, "failed to inject user turn");
                        }
                    }
                    None => handoff_open = false,
                },
                _ = tokio::time::sleep_until(flush_deadline), if flush_at.is_some() => {
                    let _ = ui.lock().await.flush().await;
                }
                event = next_event(&run) => match event {
                    Some(event) => {
                        // Abort may have been signaled inside this event's
                        // own gate callback (approve-and-clear). Drop the
                        // event instead of writing more of the old context
                        // into the thread.
                        if abort.is_aborted() {
                            break RunExit::Aborted;
                        }
                        if let Some(exit) = self
                            .handle_event(&session, &thread_id, &working_dir, &ui, &tracker, event)
                            .await
                        {
                            break exit;
                        }
                    }
                    None => break RunExit::StreamEnded,
                },
            }
        };

        tracing::debug!(thread_id = %thread_id, ?exit, "run ended");
        if exit == RunExit::Aborted {
            // An external abort already closed the run and closing is
            // idempotent; a gate-signaled abort closes it here.
            let run = run.clone();
            tokio::spawn(async move {
                run.lock().await.close().await;
            });
        }
        self.teardown(session, thread_id, abort, ui, tracker, exit)
            .await;
    }

    async fn handle_event(
        &self,
        session: &Arc<Mutex<Session>>,
        thread_id: &ThreadId,
        working_dir: &std::path::Path,
        ui: &Arc<Mutex<StreamUi>>,
        tracker: &Arc<Mutex<CardTracker>>,
        event: AgentEvent,
    ) -> Option<RunExit> {
        let config = self.inner.registry.config();
        match event {
            AgentEvent::Init(init) => {
                tracing::info!(session_id = %init.session_id, model = ?init.model, "run initialized");
                session.lock().await.remote_session_id = Some(init.session_id);
                if let Err(err) = self.inner.registry.persist(thread_id).await {
                    tracing::warn!(error = %err, "failed to persist session record");
                }
                // Opportunistic catalog warm-up; later calls hit the cache.
                let orchestrator = self.clone();
                tokio::spawn(async move {
                    let _ = orchestrator.models().await;
                });
                None
            }
            AgentEvent::CompactionNotice(data) => {
                let notice = match data.tokens_saved {
                    Some(saved) => format!("♻️ Compacted conversation history ({saved} tokens freed)"),
                    None => "♻️ Compacted conversation history".to_string(),
                };
                if let Ok(message) = self.inner.chat.send_text(thread_id, &notice).await {
                    let chat = self.inner.chat.clone();
                    let thread_id = thread_id.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(COMPACTION_NOTICE_TTL).await;
                        let _ = chat.delete_message(&thread_id, message).await;
                    });
                }
                None
            }
            AgentEvent::TextDelta(delta) => {
                let mut ui = ui.lock().await;
                ui.append(&delta.delta);
                if ui.last_flush.elapsed() >= config.min_flush_interval {
                    let _ = ui.flush().await;
                }
                None
            }
            AgentEvent::BlockStart(start) => {
                if let BlockKind::ToolUse { call_id, name } = start.block {
                    let mut tracker = tracker.lock().await;
                    tracker.open(start.index, &call_id, &name).await;
                    if let Some(summary) = tracker.summary() {
                        ui.lock().await.set_status(&summary).await;
                    }
                }
                None
            }
            AgentEvent::InputDelta(delta) => {
                tracker
                    .lock()
                    .await
                    .input_fragment(delta.index, &delta.fragment);
                None
            }
            AgentEvent::BlockEnd(end) => {
                tracker.lock().await.close_block(end.index).await;
                None
            }
            AgentEvent::ToolResult(result) => {
                tracker
                    .lock()
                    .await
                    .result(&result.call_id, &result.output, result.is_error)
                    .await;
                None
            }
            AgentEvent::ToolProgress(progress) => {
                tracker
                    .lock()
                    .await
                    .progress(&progress.call_id, progress.elapsed_ms)
                    .await;
                None
            }
            AgentEvent::AssistantTurn(turn) => {
                // Tool-only turns carry no text; skip the image scan and
                // keep the existing status message instead of reposting it.
                let has_text = {
                    let mut ui = ui.lock().await;
                    ui.reconcile(&turn.text);
                    let has_text = ui.turn_has_text();
                    let _ = ui.finish_turn().await;
                    has_text
                };
                {
                    let mut tracker = tracker.lock().await;
                    if has_text {
                        tracker.deliver_images(&turn.text, working_dir).await;
                    }
                    tracker.sweep_ephemeral().await;
                    tracker.finish_turn();
                }
                if has_text {
                    ui.lock().await.set_status(THINKING_STATUS).await;
                }
                None
            }
            AgentEvent::Result(result) => Some(
                self.handle_result(session, thread_id, ui, result)
                    .await,
            ),
        }
    }

    async fn handle_result(
        &self,
        session: &Arc<Mutex<Session>>,
        thread_id: &ThreadId,
        ui: &Arc<Mutex<StreamUi>>,
        result: ResultData,
    ) -> RunExit {
        let config = self.inner.registry.config();
        let _ = ui.lock().await.flush().await;
        {
            let mut guard = session.lock().await;
            guard.accumulated_cost_usd += result.cost_usd;
            if let Some(usage) = result.usage {
                guard.context_usage = Some(usage);
            }
        }
        if let Err(err) = self.inner.registry.persist(thread_id).await {
            tracing::warn!(error = %err, "failed to persist session record");
        }

        match result.outcome {
            RunOutcome::Success => {
                session.lock().await.turns_since_request = 0;
                RunExit::Completed
            }
            RunOutcome::TurnLimit => {
                let mut guard = session.lock().await;
                guard.turns_since_request += result.turns.max(1);
                if guard.turns_since_request < config.auto_resume_turn_ceiling {
                    guard.auto_resume_requested = true;
                    tracing::info!(
                        turns = guard.turns_since_request,
                        "turn limit hit below ceiling, auto-resuming"
                    );
                } else {
                    drop(guard);
                    let _ = self
                        .inner
                        .chat
                        .send_text(
                            thread_id,
                            &format!(
                                "⏸️ Stopped after {} turns. Send a message to continue.",
                                config.auto_resume_turn_ceiling
                            ),
                        )
                        .await;
                }
                RunExit::Completed
            }
            RunOutcome::Error { message } => {
                match classify_runtime_error(&message) {
                    RuntimeErrorKind::UnknownSession => {
                        session.lock().await.remote_session_id = None;
                        let _ = self.inner.registry.persist(thread_id).await;
                        let _ = self
                            .inner
                            .chat
                            .send_text(
                                thread_id,
                                "⚠️ The agent no longer recognizes this session. Your next message starts fresh.",
                            )
                            .await;
                    }
                    RuntimeErrorKind::ContextOverflow => {
                        {
                            let mut guard = session.lock().await;
                            guard.remote_session_id = None;
                            guard.turns_since_request = 0;
                        }
                        let _ = self.inner.registry.persist(thread_id).await;
                        let _ = self
                            .inner
                            .chat
                            .send_text(
                                thread_id,
                                "⚠️ Context window exceeded; the conversation was reset. Your next message starts fresh.",
                            )
                            .await;
                    }
                    RuntimeErrorKind::Other => {
                        let _ = self
                            .inner
                            .chat
                            .send_text(thread_id, &format!("⚠️ Run failed: {message}"))
                            .await;
                    }
                }
                RunExit::Errored
            }
        }
    }

    /// Runs on every exit path. The session stays busy (`Draining`) until
    /// the queue is confirmed empty; marking idle earlier opens a window
    /// for a second concurrent run.
    async fn teardown(
        &self,
        session: Arc<Mutex<Session>>,
        thread_id: ThreadId,
        run_abort: AbortHandle,
        ui: Arc<Mutex<StreamUi>>,
        tracker: Arc<Mutex<CardTracker>>,
        exit: RunExit,
    ) {
        {
            let mut ui = ui.lock().await;
            let _ = ui.flush().await;
            ui.clear_status().await;
        }
        tracker.lock().await.sweep_ephemeral().await;
        let _ = self.inner.chat.set_typing(&thread_id, false).await;

        let (next_prompt, finished_background) = {
            let mut guard = session.lock().await;
            // An external abort already ran the full cancellation sequence
            // and issued a fresh handle; a new generation may even be
            // active. Nothing left for this driver to do.
            if !guard.abort.same(&run_abort) {
                return;
            }
            guard.phase = RunPhase::Draining;
            guard.run = None;
            if let Some(handoff) = guard.handoff.take() {
                handoff.close().await;
                let unconsumed = handoff.drain().await;
                for text in unconsumed.into_iter().rev() {
                    guard.queue.push_front(text);
                }
            }
            // Clear-context was granted mid-run; applied only now, after
            // the event stream is fully settled.
            if let Some(plan) = guard.pending_clear_context.take() {
                guard.remote_session_id = None;
                guard.turns_since_request = 0;
                guard.abort = AbortHandle::new();
                guard
                    .queue
                    .push_front(format!("Implement the following plan:\n\n{plan}"));
            }
            if std::mem::take(&mut guard.auto_resume_requested) {
                guard.queue.push_front(CONTINUE_PROMPT.to_string());
            }
            match guard.queue.pop_front() {
                Some(prompt) => (Some(prompt), None),
                None => {
                    guard.phase = RunPhase::Idle;
                    // A detached background session with nothing left to do
                    // is finished; drop its bookkeeping entry.
                    let finished = guard.background.take().map(|meta| meta.task_id);
                    (None, finished)
                }
            }
        };
        if let Err(err) = self.inner.registry.persist(&thread_id).await {
            tracing::warn!(error = %err, "failed to persist session record");
        }
        if let Some(task_id) = finished_background {
            self.inner
                .registry
                .release_background_task(&thread_id, task_id)
                .await;
            tracing::info!(thread_id = %thread_id, task_id, "background task finished");
        }

        if exit == RunExit::StreamEnded {
            tracing::warn!(thread_id = %thread_id, "event stream ended without a result");
        }
        if let Some(prompt) = next_prompt {
            if let Err(err) = self.start_run(session.clone(), prompt).await {
                tracing::error!(error = %err, "failed to start queued run");
                session.lock().await.phase = RunPhase::Idle;
            }
        }
    }

    fn permission_gate(&self, ctx: GateCtx) -> PermissionGate {
        let ctx = Arc::new(ctx);
        Arc::new(move |request| {
            let ctx = ctx.clone();
            Box::pin(async move { ctx.decide(request).await })
        })
    }
}

/// Bundled driver arguments; the driver consumes all of them.
struct DriveArgs {
    session: Arc<Mutex<Session>>,
    run: Arc<Mutex<Box<dyn AgentRun>>>,
    handoff: Arc<HandoffChannel>,
    abort: AbortHandle,
    ui: Arc<Mutex<StreamUi>>,
    tracker: Arc<Mutex<CardTracker>>,
    thread_id: ThreadId,
    working_dir: PathBuf,
}

async fn next_event(run: &Arc<Mutex<Box<dyn AgentRun>>>) -> Option<AgentEvent> {
    run.lock().await.next_event().await
}

/// Everything the gate callback needs to bridge a blocking tool request to
/// a user prompt in the conversation thread.
struct GateCtx {
    orchestrator: Orchestrator,
    session: Arc<Mutex<Session>>,
    thread_id: ThreadId,
    working_dir: PathBuf,
    ui: Arc<Mutex<StreamUi>>,
    tracker: Arc<Mutex<CardTracker>>,
}

impl GateCtx {
    /// Read at prompt time, not captured at run start: a run demoted to the
    /// background mid-flight must auto-answer from that point on.
    async fn is_background(&self) -> bool {
        self.session.lock().await.background.is_some()
    }

    async fn decide(&self, request: PermissionRequest) -> GateDecision {
        match request {
            PermissionRequest::Generic {
                tool_name,
                call_id,
                input,
            } => {
                // Some runtimes route tool use through the gate without
                // emitting block-start events; the card upsert converges
                // both paths on the same call id.
                {
                    let mut tracker = self.tracker.lock().await;
                    tracker.open_call(&call_id, &tool_name, Some(&input)).await;
                    if let Some(summary) = tracker.summary() {
                        self.ui.lock().await.set_status(&summary).await;
                    }
                }
                let jitter = self.orchestrator.inner.registry.config().auto_allow_jitter;
                if !jitter.is_zero() {
                    let millis = rand::thread_rng().gen_range(0..=jitter.as_millis() as u64);
                    tokio::time::sleep(Duration::from_millis(millis)).await;
                }
                tracing::debug!(tool = %tool_name, call_id = %call_id, "auto-allowing tool call");
                GateDecision::Allow
            }
            PermissionRequest::Interactive(request) => self.interactive(request).await,
            PermissionRequest::Plan(request) => self.plan(request).await,
        }
    }

    async fn interactive(&self, request: InteractiveRequest) -> GateDecision {
        if self.is_background().await {
            // Nobody is watching a backgrounded run; answer with defaults so
            // it keeps moving.
            let _ = self
                .orchestrator
                .inner
                .chat
                .send_text(
                    &self.thread_id,
                    "🔕 A background task asked a question; answered with defaults.",
                )
                .await;
            return GateDecision::AllowWithInput(answers_value(&auto_answers(&request)));
        }
        self.pause_for_prompt().await;
        let chat = self.orchestrator.inner.chat.clone();
        let (pending, rx) =
            match PendingInteractive::open(chat, self.thread_id.clone(), &request).await {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::warn!(error = %err, "failed to render interactive prompt, answering with defaults");
                    return GateDecision::AllowWithInput(answers_value(&auto_answers(&request)));
                }
            };
        self.session.lock().await.pending_interactive = Some(pending);
        let decision = match rx.await {
            Ok(answers) => GateDecision::AllowWithInput(answers_value(&answers)),
            // Resolver dropped: the session was aborted while waiting.
            Err(_) => GateDecision::Deny {
                reason: "cancelled".to_string(),
            },
        };
        self.session.lock().await.pending_interactive = None;
        self.resume_after_prompt().await;
        decision
    }

    async fn plan(&self, request: PlanRequest) -> GateDecision {
        if self.is_background().await {
            let _ = self
                .orchestrator
                .inner
                .chat
                .send_text(
                    &self.thread_id,
                    "🔕 A background task presented a plan; approved without clearing context.",
                )
                .await;
            return GateDecision::Allow;
        }
        let config = self.orchestrator.inner.registry.config();
        let plan = request.plan.or_else(|| {
            find_recent_plan(&self.working_dir, config.plan_recency_window)
        });
        self.pause_for_prompt().await;
        let chat = self.orchestrator.inner.chat.clone();
        let (pending, rx) = match PendingPlan::open(chat, self.thread_id.clone(), plan).await {
            Ok(pair) => pair,
            Err(err) => {
                tracing::warn!(error = %err, "failed to render plan prompt, approving in place");
                return GateDecision::Allow;
            }
        };
        self.session.lock().await.pending_plan = Some(pending.clone());
        let decision = rx.await;
        self.session.lock().await.pending_plan = None;
        self.resume_after_prompt().await;
        match decision {
            Ok(PlanDecision::ApproveKeep) => GateDecision::Allow,
            Ok(PlanDecision::ApproveClear) => {
                let mut guard = self.session.lock().await;
                let plan_text = pending
                    .plan_text()
                    .unwrap_or("Implement the plan you presented.")
                    .to_string();
                guard.pending_clear_context = Some(plan_text);
                // The approved call still returns to the agent, but the old
                // context ends here: signal the run's abort handle so the
                // driver winds down once this event settles. Teardown then
                // drops the remote id and front-queues the plan.
                guard.abort.abort();
                GateDecision::Allow
            }
            Ok(PlanDecision::Reject { feedback }) => GateDecision::Deny {
                reason: feedback.unwrap_or_else(|| {
                    "The plan was rejected. Revise it and present it again.".to_string()
                }),
            },
            Err(_) => GateDecision::Deny {
                reason: "cancelled".to_string(),
            },
        }
    }

    /// The prompt owns the thread UI while it is open: status indicator and
    /// ephemeral cards go away, typing pauses.
    async fn pause_for_prompt(&self) {
        self.ui.lock().await.clear_status().await;
        self.tracker.lock().await.sweep_ephemeral().await;
        let _ = self
            .orchestrator
            .inner
            .chat
            .set_typing(&self.thread_id, false)
            .await;
    }

    async fn resume_after_prompt(&self) {
        self.ui.lock().await.set_status(THINKING_STATUS).await;
        let _ = self
            .orchestrator
            .inner
            .chat
            .set_typing(&self.thread_id, true)
            .await;
    }
}

fn answers_value(answers: &Answers) -> serde_json::Value {
    json!({ "answers": answers })
}
