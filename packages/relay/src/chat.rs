//! Chat-platform boundary. The core only needs message primitives: send,
//! edit, delete, files, threads, and button rows with opaque interaction
//! ids. A concrete adapter (Discord, Telegram, ...) implements this trait.

use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use agent_relay_error::RelayError;

/// Opaque platform message handle. Stable for the lifetime of the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageRef(pub u64);

/// Stable external identity of a conversation thread.
pub type ThreadId = String;

/// Rich message form. Platforms without embeds render title + description
/// as plain text.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Embed {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub color: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub footer: Option<String>,
}

impl Embed {
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn titled(mut self, title: impl Into<String>) -> Self {
        self.title = Some(title.into());
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Button {
    /// Opaque id assigned by the core; interaction callbacks echo it back.
    pub custom_id: String,
    pub label: String,
    pub style: ButtonStyle,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ButtonStyle {
    Primary,
    Secondary,
    Success,
    Danger,
}

/// Inbound message as delivered by the platform adapter.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub thread_id: ThreadId,
    pub message: MessageRef,
    pub author: String,
    pub text: String,
    pub attachments: Vec<String>,
}

#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn send_text(&self, thread: &ThreadId, text: &str) -> Result<MessageRef, RelayError>;

    async fn send_embed(
        &self,
        thread: &ThreadId,
        embed: &Embed,
        buttons: &[Button],
    ) -> Result<MessageRef, RelayError>;

    /// Fails with `RelayError::MessageDeleted` if the target no longer
    /// exists; the caller then sends a replacement instead.
    async fn edit_text(
        &self,
        thread: &ThreadId,
        message: MessageRef,
        text: &str,
    ) -> Result<(), RelayError>;

    async fn edit_embed(
        &self,
        thread: &ThreadId,
        message: MessageRef,
        embed: &Embed,
        buttons: &[Button],
    ) -> Result<(), RelayError>;

    async fn delete_message(&self, thread: &ThreadId, message: MessageRef)
        -> Result<(), RelayError>;

    async fn send_file(
        &self,
        thread: &ThreadId,
        path: &Path,
        caption: Option<&str>,
    ) -> Result<MessageRef, RelayError>;

    /// Create a dedicated thread from a top-level message.
    async fn create_thread(
        &self,
        channel_id: &str,
        source: MessageRef,
        title: &str,
    ) -> Result<ThreadId, RelayError>;

    async fn set_typing(&self, thread: &ThreadId, active: bool) -> Result<(), RelayError>;

    /// Hard cap on outbound message length; flushed text is chunked to fit.
    fn message_limit(&self) -> usize {
        2000
    }
}
