//! The seam between the bridge session and a chat platform.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use codex_opencode_bridge_error::BridgeError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("chat api returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("chat resource not found: {0}")]
    NotFound(String),
    #[error("chat authentication rejected: {0}")]
    Unauthorized(String),
    #[error("channel {0} is not a guild text channel")]
    InvalidChannel(String),
}

impl From<ChatError> for BridgeError {
    fn from(err: ChatError) -> Self {
        BridgeError::Delivery {
            message: err.to_string(),
        }
    }
}

/// Structured message body, shaped like a Discord embed.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Embed {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<EmbedField>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbedField {
    pub name: String,
    pub value: String,
    #[serde(default)]
    pub inline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessageRef {
    pub id: String,
    pub channel_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatThread {
    pub id: String,
    pub name: String,
}

/// A message a human (or bot) posted, as seen by the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub id: String,
    /// Thread id when `in_thread` is set, otherwise the plain channel id.
    pub channel_id: String,
    pub in_thread: bool,
    /// The thread's display name when the platform delivered it alongside.
    pub thread_name: Option<String>,
    pub author_is_bot: bool,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChatInbound {
    Message(InboundMessage),
    ThreadDeleted { thread_id: String },
}

#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn send_embed(&self, channel_id: &str, embed: &Embed) -> Result<ChatMessageRef, ChatError>;

    async fn send_text(&self, channel_id: &str, content: &str) -> Result<ChatMessageRef, ChatError>;

    /// Starts a public thread hanging off `message_id`.
    async fn start_thread(
        &self,
        channel_id: &str,
        message_id: &str,
        name: &str,
    ) -> Result<ChatThread, ChatError>;

    async fn react(&self, channel_id: &str, message_id: &str, emoji: &str) -> Result<(), ChatError>;

    /// Current name of a thread, `None` if it does not exist.
    async fn thread_name(&self, thread_id: &str) -> Result<Option<String>, ChatError>;
}
