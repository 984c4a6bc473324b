//! Conversation registry: in-memory thread-id → session map, durable record
//! policy, idle eviction, and background-task bookkeeping.
//!
//! Eviction removes a session from memory but deliberately keeps its durable
//! record; a later message in the same thread rehydrates a fresh session
//! pre-populated with the remote session id, working directory, and
//! accumulated cost, so the conversation continues seamlessly.

use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use agent_relay_error::RelayError;

use crate::abort::AbortHandle;
use crate::chat::ThreadId;
use crate::config::RelayConfig;
use crate::events::ContextUsage;
use crate::handoff::HandoffChannel;
use crate::prompt::interactive::PendingInteractive;
use crate::prompt::plan::PendingPlan;
use crate::runtime::AgentRun;
use crate::store::{SessionRecord, SessionStore};

/// Single-flight discipline for one session. Exactly one writer — the
/// orchestrator's run driver — moves a session out of `Active`/`Draining`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    /// A run is consuming its event stream.
    Active,
    /// The run finished and teardown is dispatching queued input. Still
    /// busy: a new top-level message must not start a second run.
    Draining,
}

impl RunPhase {
    pub fn is_busy(self) -> bool {
        !matches!(self, RunPhase::Idle)
    }
}

#[derive(Debug, Clone)]
pub struct BackgroundMeta {
    pub task_id: u64,
    pub label: String,
}

/// Per-thread state surviving across runs while resident in memory.
pub struct Session {
    pub thread_id: ThreadId,
    pub remote_session_id: Option<String>,
    pub working_dir: PathBuf,
    pub phase: RunPhase,
    pub last_activity: Instant,
    pub abort: AbortHandle,
    pub run: Option<Arc<Mutex<Box<dyn AgentRun>>>>,
    pub handoff: Option<Arc<HandoffChannel>>,
    /// Prompts that could not be injected live; drained one at a time by
    /// run teardown, FIFO.
    pub queue: VecDeque<String>,
    pub pending_interactive: Option<Arc<PendingInteractive>>,
    pub pending_plan: Option<Arc<PendingPlan>>,
    /// Plan text captured by an approve-and-clear decision; applied during
    /// teardown (two-phase shutdown, never mid-event).
    pub pending_clear_context: Option<String>,
    pub accumulated_cost_usd: f64,
    /// Cumulative turns across auto-resumes for the current user request.
    pub turns_since_request: u32,
    pub auto_resume_requested: bool,
    pub context_usage: Option<ContextUsage>,
    pub background: Option<BackgroundMeta>,
}

impl Session {
    fn new(thread_id: ThreadId, working_dir: PathBuf) -> Self {
        Self {
            thread_id,
            remote_session_id: None,
            working_dir,
            phase: RunPhase::Idle,
            last_activity: Instant::now(),
            abort: AbortHandle::new(),
            run: None,
            handoff: None,
            queue: VecDeque::new(),
            pending_interactive: None,
            pending_plan: None,
            pending_clear_context: None,
            accumulated_cost_usd: 0.0,
            turns_since_request: 0,
            auto_resume_requested: false,
            context_usage: None,
            background: None,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.phase.is_busy()
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("thread_id", &self.thread_id)
            .field("remote_session_id", &self.remote_session_id)
            .field("phase", &self.phase)
            .field("queue_len", &self.queue.len())
            .finish_non_exhaustive()
    }
}

/// Full cancellation sequence. All five steps always run together; a
/// partial abort (closing the channel but leaving the queue, or forgetting
/// the fresh handle) leaves the session stuck.
pub async fn abort_session(session: &mut Session) {
    session.abort.abort();
    if let Some(handoff) = session.handoff.take() {
        handoff.close().await;
    }
    if let Some(run) = session.run.take() {
        tokio::spawn(async move {
            run.lock().await.close().await;
        });
    }
    session.queue.clear();
    session.pending_interactive = None;
    session.pending_plan = None;
    session.pending_clear_context = None;
    session.auto_resume_requested = false;
    session.abort = AbortHandle::new();
    session.phase = RunPhase::Idle;
}

#[derive(Debug)]
pub struct BackgroundTask {
    pub task_id: u64,
    pub label: String,
    pub started_at: DateTime<Utc>,
    pub session: Arc<Mutex<Session>>,
}

struct RegistryInner {
    sessions: Mutex<HashMap<ThreadId, Arc<Mutex<Session>>>>,
    background: Mutex<HashMap<ThreadId, Vec<BackgroundTask>>>,
    next_task_id: Mutex<HashMap<ThreadId, u64>>,
    store: Arc<dyn SessionStore>,
    config: RelayConfig,
    model_override: Mutex<Option<String>>,
    sweep: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(store: Arc<dyn SessionStore>, config: RelayConfig) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                background: Mutex::new(HashMap::new()),
                next_task_id: Mutex::new(HashMap::new()),
                store,
                config,
                model_override: Mutex::new(None),
                sweep: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &RelayConfig {
        &self.inner.config
    }

    pub fn store(&self) -> Arc<dyn SessionStore> {
        self.inner.store.clone()
    }

    pub async fn set_model(&self, model: Option<String>) {
        *self.inner.model_override.lock().await = model;
    }

    pub async fn model(&self) -> Option<String> {
        self.inner.model_override.lock().await.clone()
    }

    pub async fn create(
        &self,
        thread_id: &ThreadId,
        working_dir: PathBuf,
    ) -> Result<Arc<Mutex<Session>>, RelayError> {
        let mut sessions = self.inner.sessions.lock().await;
        if sessions.contains_key(thread_id) {
            return Err(RelayError::InvalidRequest {
                message: format!("session already exists for thread {thread_id}"),
            });
        }
        let session = Arc::new(Mutex::new(Session::new(thread_id.clone(), working_dir)));
        sessions.insert(thread_id.clone(), session.clone());
        drop(sessions);
        self.persist(thread_id).await?;
        Ok(session)
    }

    pub async fn get(&self, thread_id: &ThreadId) -> Option<Arc<Mutex<Session>>> {
        self.inner.sessions.lock().await.get(thread_id).cloned()
    }

    /// Resident session, or a fresh one rebuilt from the durable record if
    /// the thread was evicted. `None` means the thread is unknown.
    pub async fn get_or_rehydrate(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<Arc<Mutex<Session>>>, RelayError> {
        if let Some(session) = self.get(thread_id).await {
            return Ok(Some(session));
        }
        let record = match self.inner.store.load(thread_id).await? {
            Some(record) => record,
            None => return Ok(None),
        };
        let mut session = Session::new(
            thread_id.clone(),
            record.working_dir.unwrap_or_else(|| PathBuf::from(".")),
        );
        session.remote_session_id = record.remote_session_id;
        session.accumulated_cost_usd = record.accumulated_cost_usd;
        let session = Arc::new(Mutex::new(session));
        self.inner
            .sessions
            .lock()
            .await
            .insert(thread_id.clone(), session.clone());
        tracing::info!(thread_id = %thread_id, "rehydrated session from durable record");
        Ok(Some(session))
    }

    pub async fn touch(&self, thread_id: &ThreadId) {
        if let Some(session) = self.get(thread_id).await {
            session.lock().await.touch();
        }
    }

    pub async fn add_cost(&self, thread_id: &ThreadId, amount: f64) -> Result<(), RelayError> {
        if let Some(session) = self.get(thread_id).await {
            session.lock().await.accumulated_cost_usd += amount;
        }
        self.persist(thread_id).await
    }

    pub async fn persist(&self, thread_id: &ThreadId) -> Result<(), RelayError> {
        let session = match self.get(thread_id).await {
            Some(session) => session,
            None => return Ok(()),
        };
        let record = {
            let guard = session.lock().await;
            SessionRecord {
                remote_session_id: guard.remote_session_id.clone(),
                working_dir: Some(guard.working_dir.clone()),
                accumulated_cost_usd: guard.accumulated_cost_usd,
            }
        };
        self.inner.store.save(thread_id, &record).await
    }

    /// Abort any active run, keep the session resident, keep the durable
    /// record.
    pub async fn abort(&self, thread_id: &ThreadId) -> Result<(), RelayError> {
        let session = self
            .get(thread_id)
            .await
            .ok_or_else(|| RelayError::SessionNotFound {
                thread_id: thread_id.clone(),
            })?;
        abort_session(&mut *session.lock().await).await;
        Ok(())
    }

    /// Abort everything, clear remote identity and pending state, erase the
    /// durable record. The next run in this thread starts fresh.
    pub async fn reset(&self, thread_id: &ThreadId) -> Result<(), RelayError> {
        let session = self
            .get(thread_id)
            .await
            .ok_or_else(|| RelayError::SessionNotFound {
                thread_id: thread_id.clone(),
            })?;
        {
            let mut guard = session.lock().await;
            abort_session(&mut guard).await;
            guard.remote_session_id = None;
            guard.turns_since_request = 0;
            guard.context_usage = None;
            guard.accumulated_cost_usd = 0.0;
        }
        self.inner.store.remove(thread_id).await
    }

    /// Reset plus removal from memory entirely.
    pub async fn remove(&self, thread_id: &ThreadId) -> Result<(), RelayError> {
        self.reset(thread_id).await?;
        self.inner.sessions.lock().await.remove(thread_id);
        self.abort_all_background(thread_id).await;
        Ok(())
    }

    /// Detach a busy session into the background list, freeing the thread's
    /// foreground slot, and create a replacement foreground session that
    /// inherits remote identity, cost, and context stats.
    pub async fn demote_to_background(
        &self,
        thread_id: &ThreadId,
        label: &str,
    ) -> Result<(u64, Arc<Mutex<Session>>), RelayError> {
        let mut sessions = self.inner.sessions.lock().await;
        let current = sessions
            .get(thread_id)
            .cloned()
            .ok_or_else(|| RelayError::SessionNotFound {
                thread_id: thread_id.clone(),
            })?;
        let (meta, remote_session_id, working_dir, cost, usage) = {
            let mut guard = current.lock().await;
            if !guard.is_busy() {
                return Err(RelayError::InvalidRequest {
                    message: "only a busy session can be backgrounded".to_string(),
                });
            }
            let task_id = {
                let mut ids = self.inner.next_task_id.lock().await;
                let next = ids.entry(thread_id.clone()).or_insert(1);
                let id = *next;
                *next += 1;
                id
            };
            let meta = BackgroundMeta {
                task_id,
                label: label.to_string(),
            };
            guard.background = Some(meta.clone());
            (
                meta,
                guard.remote_session_id.clone(),
                guard.working_dir.clone(),
                guard.accumulated_cost_usd,
                guard.context_usage,
            )
        };

        sessions.remove(thread_id);
        let mut replacement = Session::new(thread_id.clone(), working_dir);
        replacement.remote_session_id = remote_session_id;
        replacement.accumulated_cost_usd = cost;
        replacement.context_usage = usage;
        let replacement = Arc::new(Mutex::new(replacement));
        sessions.insert(thread_id.clone(), replacement.clone());
        drop(sessions);

        self.inner
            .background
            .lock()
            .await
            .entry(thread_id.clone())
            .or_default()
            .push(BackgroundTask {
                task_id: meta.task_id,
                label: meta.label.clone(),
                started_at: Utc::now(),
                session: current,
            });
        tracing::info!(thread_id = %thread_id, task_id = meta.task_id, label = %meta.label, "session backgrounded");
        Ok((meta.task_id, replacement))
    }

    pub async fn background_tasks(&self, thread_id: &ThreadId) -> Vec<(u64, String, DateTime<Utc>)> {
        self.inner
            .background
            .lock()
            .await
            .get(thread_id)
            .map(|tasks| {
                tasks
                    .iter()
                    .map(|task| (task.task_id, task.label.clone(), task.started_at))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Remove a finished background task without aborting it.
    pub async fn release_background_task(&self, thread_id: &ThreadId, task_id: u64) {
        let mut background = self.inner.background.lock().await;
        if let Some(tasks) = background.get_mut(thread_id) {
            tasks.retain(|task| task.task_id != task_id);
            if tasks.is_empty() {
                background.remove(thread_id);
            }
        }
    }

    /// Aborting a background task replicates the full foreground
    /// cancellation sequence.
    pub async fn abort_background_task(
        &self,
        thread_id: &ThreadId,
        task_id: u64,
    ) -> Result<(), RelayError> {
        let task = {
            let mut background = self.inner.background.lock().await;
            let tasks = background
                .get_mut(thread_id)
                .ok_or_else(|| RelayError::SessionNotFound {
                    thread_id: thread_id.clone(),
                })?;
            let index = tasks
                .iter()
                .position(|task| task.task_id == task_id)
                .ok_or_else(|| RelayError::InvalidRequest {
                    message: format!("no background task {task_id} for thread {thread_id}"),
                })?;
            tasks.remove(index)
        };
        abort_session(&mut *task.session.lock().await).await;
        Ok(())
    }

    pub async fn abort_all_background(&self, thread_id: &ThreadId) {
        let tasks = self.inner.background.lock().await.remove(thread_id);
        if let Some(tasks) = tasks {
            for task in tasks {
                abort_session(&mut *task.session.lock().await).await;
            }
        }
    }

    /// Start the periodic idle-eviction sweep. Call once.
    pub fn start_sweep(&self) {
        let registry = self.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(registry.inner.config.sweep_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                registry.evict_idle().await;
            }
        });
        if let Ok(mut sweep) = self.inner.sweep.try_lock() {
            *sweep = Some(handle);
        }
    }

    /// Evict sessions idle past the threshold: full in-memory abort
    /// sequence, removal from the map, durable record untouched.
    pub async fn evict_idle(&self) {
        let idle_timeout = self.inner.config.idle_timeout;
        let now = Instant::now();
        let mut evicted = Vec::new();
        {
            let mut sessions = self.inner.sessions.lock().await;
            let mut stale = Vec::new();
            for (thread_id, session) in sessions.iter() {
                let guard = session.lock().await;
                if now.duration_since(guard.last_activity) >= idle_timeout {
                    stale.push(thread_id.clone());
                }
            }
            for thread_id in stale {
                if let Some(session) = sessions.remove(&thread_id) {
                    evicted.push((thread_id, session));
                }
            }
        }
        for (thread_id, session) in evicted {
            abort_session(&mut *session.lock().await).await;
            tracing::info!(thread_id = %thread_id, "evicted idle session (durable record kept)");
        }
    }

    /// Abort all sessions and background tasks and stop the sweep.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.inner.sweep.lock().await.take() {
            handle.abort();
        }
        let sessions = {
            let mut map = self.inner.sessions.lock().await;
            map.drain().collect::<Vec<_>>()
        };
        for (_, session) in sessions {
            abort_session(&mut *session.lock().await).await;
        }
        let background = {
            let mut map = self.inner.background.lock().await;
            map.drain().collect::<Vec<_>>()
        };
        for (_, tasks) in background {
            for task in tasks {
                abort_session(&mut *task.session.lock().await).await;
            }
        }
    }
}
