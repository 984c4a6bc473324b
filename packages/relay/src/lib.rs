//! Bridge between a thread-based chat surface and a streaming coding-agent
//! runtime. One conversation thread maps to one agent session; the
//! orchestrator multiplexes the runtime's event stream into live-edited chat
//! messages, tool lifecycle cards, and blocking interactive prompts.

pub mod abort;
pub mod chat;
pub mod cli;
pub mod commands;
pub mod config;
pub mod events;
pub mod handoff;
pub mod orchestrator;
pub mod prompt;
pub mod registry;
pub mod runtime;
pub mod store;
pub mod telemetry;
