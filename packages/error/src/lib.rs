use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    InvalidRequest,
    SessionNotFound,
    SessionExpired,
    SessionBusy,
    RuntimeError,
    MessageDeleted,
    DeliveryError,
    StoreError,
    ChannelClosed,
    Aborted,
}

#[derive(Debug, Clone, Error)]
pub enum RelayError {
    #[error("invalid request: {message}")]
    InvalidRequest { message: String },
    #[error("session not found: {thread_id}")]
    SessionNotFound { thread_id: String },
    #[error("session expired: {thread_id}")]
    SessionExpired { thread_id: String },
    #[error("session busy: {thread_id}")]
    SessionBusy { thread_id: String },
    #[error("runtime error: {message}")]
    RuntimeError { message: String },
    #[error("message deleted")]
    MessageDeleted,
    #[error("delivery error: {message}")]
    DeliveryError { message: String },
    #[error("store error: {message}")]
    StoreError { message: String },
    #[error("channel closed")]
    ChannelClosed,
    #[error("aborted")]
    Aborted,
}

impl RelayError {
    pub fn error_type(&self) -> ErrorType {
        match self {
            Self::InvalidRequest { .. } => ErrorType::InvalidRequest,
            Self::SessionNotFound { .. } => ErrorType::SessionNotFound,
            Self::SessionExpired { .. } => ErrorType::SessionExpired,
            Self::SessionBusy { .. } => ErrorType::SessionBusy,
            Self::RuntimeError { .. } => ErrorType::RuntimeError,
            Self::MessageDeleted => ErrorType::MessageDeleted,
            Self::DeliveryError { .. } => ErrorType::DeliveryError,
            Self::StoreError { .. } => ErrorType::StoreError,
            Self::ChannelClosed => ErrorType::ChannelClosed,
            Self::Aborted => ErrorType::Aborted,
        }
    }

    /// Whether a chat delivery failure should trigger a replacement send
    /// (the target message no longer exists) rather than a silent retry on
    /// the next natural flush.
    pub fn is_message_deleted(&self) -> bool {
        matches!(self, Self::MessageDeleted)
    }
}

/// Classification of a terminal runtime error, derived from the error text
/// the agent runtime reports. The runtime does not expose structured error
/// codes for these conditions, only recognizable substrings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuntimeErrorKind {
    /// The resumed session id is unknown to the runtime. Recover by
    /// clearing the stale identity so the next message starts fresh.
    UnknownSession,
    /// The conversation no longer fits the model's context window. Recover
    /// by resetting session identity and notifying the user.
    ContextOverflow,
    /// Anything else; surfaced verbatim.
    Other,
}

pub fn classify_runtime_error(message: &str) -> RuntimeErrorKind {
    let lower = message.to_ascii_lowercase();
    if lower.contains("no conversation found")
        || lower.contains("unknown session")
        || lower.contains("session not found")
    {
        RuntimeErrorKind::UnknownSession
    } else if lower.contains("context window") || lower.contains("prompt is too long") {
        RuntimeErrorKind::ContextOverflow
    } else {
        RuntimeErrorKind::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_unknown_session() {
        assert_eq!(
            classify_runtime_error("No conversation found with session ID abc"),
            RuntimeErrorKind::UnknownSession
        );
    }

    #[test]
    fn classifies_context_overflow() {
        assert_eq!(
            classify_runtime_error("Error: prompt is too long for the model"),
            RuntimeErrorKind::ContextOverflow
        );
        assert_eq!(
            classify_runtime_error("context window exceeded"),
            RuntimeErrorKind::ContextOverflow
        );
    }

    #[test]
    fn other_errors_pass_through() {
        assert_eq!(
            classify_runtime_error("rate limited, retry later"),
            RuntimeErrorKind::Other
        );
    }
}
