//! Blocking user prompts: the interactive question bridge and the plan
//! approval bridge. Each renders UI in the conversation thread, parks the
//! agent run on an unresolved future, and resolves it from free-text
//! replies.

pub mod interactive;
pub mod plan;
