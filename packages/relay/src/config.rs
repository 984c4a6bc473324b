//! Tunables for the orchestration engine. Defaults match the behavior the
//! bridge ships with; everything is overridable from the environment.

use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RelayConfig {
    /// Minimum interval between outbound edits of the live message.
    pub min_flush_interval: Duration,
    /// Per-run turn ceiling passed to the runtime.
    pub max_turns_per_run: u32,
    /// Cumulative turn ceiling across auto-resumes for one user request.
    pub auto_resume_turn_ceiling: u32,
    /// Sessions idle longer than this are evicted from memory.
    pub idle_timeout: Duration,
    /// How often the eviction sweep runs.
    pub sweep_interval: Duration,
    /// Plan documents modified longer ago than this are treated as stale.
    pub plan_recency_window: Duration,
    /// Tail of tool output attached to terminal tool cards.
    pub tool_result_tail_chars: usize,
    /// Upper bound of the randomized delay before auto-allowing a generic
    /// tool call, to avoid saturating the transport.
    pub auto_allow_jitter: Duration,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            min_flush_interval: Duration::from_millis(1500),
            max_turns_per_run: 30,
            auto_resume_turn_ceiling: 120,
            idle_timeout: Duration::from_secs(60 * 60),
            sweep_interval: Duration::from_secs(10 * 60),
            plan_recency_window: Duration::from_secs(5 * 60),
            tool_result_tail_chars: 600,
            auto_allow_jitter: Duration::from_millis(250),
        }
    }
}

impl RelayConfig {
    /// Build from `AGENT_RELAY_*` environment variables, falling back to the
    /// defaults for anything unset or unparsable.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(ms) = env_u64("AGENT_RELAY_FLUSH_INTERVAL_MS") {
            config.min_flush_interval = Duration::from_millis(ms);
        }
        if let Some(turns) = env_u64("AGENT_RELAY_MAX_TURNS") {
            config.max_turns_per_run = turns as u32;
        }
        if let Some(turns) = env_u64("AGENT_RELAY_TURN_CEILING") {
            config.auto_resume_turn_ceiling = turns as u32;
        }
        if let Some(secs) = env_u64("AGENT_RELAY_IDLE_TIMEOUT_SECS") {
            config.idle_timeout = Duration::from_secs(secs);
        }
        if let Some(secs) = env_u64("AGENT_RELAY_SWEEP_INTERVAL_SECS") {
            config.sweep_interval = Duration::from_secs(secs);
        }
        config
    }
}

fn env_u64(key: &str) -> Option<u64> {
    env::var(key).ok().and_then(|value| value.parse().ok())
}
