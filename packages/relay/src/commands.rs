//! Thin command layer exposed to the outer surface (slash commands, admin
//! tooling). Every operation is a wrapper over the registry or orchestrator;
//! no orchestration logic lives here.

use agent_relay_error::RelayError;

use crate::chat::ThreadId;
use crate::events::ContextUsage;
use crate::orchestrator::Orchestrator;
use crate::registry::SessionRegistry;
use crate::runtime::ModelInfo;

#[derive(Clone)]
pub struct CommandLayer {
    registry: SessionRegistry,
    orchestrator: Orchestrator,
}

impl CommandLayer {
    pub fn new(orchestrator: Orchestrator) -> Self {
        Self {
            registry: orchestrator.registry().clone(),
            orchestrator,
        }
    }

    /// Abort everything in the thread and wipe its identity and durable
    /// record. The next message starts a brand-new agent session.
    pub async fn reset(&self, thread_id: &ThreadId) -> Result<(), RelayError> {
        tracing::info!(thread_id = %thread_id, "reset requested");
        self.registry.reset(thread_id).await
    }

    /// Stop the active run; session identity and durable record survive.
    pub async fn abort(&self, thread_id: &ThreadId) -> Result<(), RelayError> {
        tracing::info!(thread_id = %thread_id, "abort requested");
        self.registry.abort(thread_id).await
    }

    /// Override the model for subsequently started runs. `None` restores
    /// the runtime default.
    pub async fn set_model(&self, model: Option<String>) {
        tracing::info!(model = ?model, "model override changed");
        self.registry.set_model(model).await;
    }

    pub async fn cost(&self, thread_id: &ThreadId) -> Result<f64, RelayError> {
        if let Some(session) = self.registry.get(thread_id).await {
            return Ok(session.lock().await.accumulated_cost_usd);
        }
        let record = self.registry.store().load(thread_id).await?.ok_or_else(|| {
            RelayError::SessionNotFound {
                thread_id: thread_id.clone(),
            }
        })?;
        Ok(record.accumulated_cost_usd)
    }

    /// Last reported context-window usage, if the runtime has provided one.
    pub async fn context_usage(
        &self,
        thread_id: &ThreadId,
    ) -> Result<Option<ContextUsage>, RelayError> {
        let session =
            self.registry
                .get(thread_id)
                .await
                .ok_or_else(|| RelayError::SessionNotFound {
                    thread_id: thread_id.clone(),
                })?;
        let usage = session.lock().await.context_usage;
        Ok(usage)
    }

    /// Selectable models, served from the orchestrator's cached catalog.
    pub async fn models(&self) -> Vec<ModelInfo> {
        self.orchestrator.models().await
    }
}
